//! Git-versioned record directories.
//!
//! Every clinic record (a patient, an encounter with its versions, an anesthesia assessment)
//! lives in its own directory which is also a git repository (`git2`/libgit2). A store
//! transaction becomes exactly one commit in that repository, so the history of a record is its
//! audit trail.
//!
//! [`VersionedFileService`] provides the two write paths the store needs:
//!
//! - [`VersionedFileService::init_and_commit`] for a new record: initialise the repository,
//!   write the initial files and commit, removing the whole directory if anything fails
//! - [`VersionedFileService::write_and_commit_files`] for an existing record: write files and
//!   commit, restoring previous file contents if anything fails
//!
//! ## Branch policy
//!
//! Record repositories always commit to `refs/heads/main`, regardless of the host's
//! `init.defaultBranch`.
//!
//! ## Commit messages
//!
//! Commit messages are labels, not prose. They never contain patient identifiers or clinical
//! text; see [`ClinicCommitMessage`].

use crate::constants::COMMIT_EMAIL_DOMAIN;
use crate::ids::ActorId;
use crate::store::{ChangeAction, ChangeMeta, RecordDomain, StoreError, StoreResult};
use clinic_types::NonEmptyText;
use std::io::Write as _;
use std::path::{Component, Path, PathBuf};

#[cfg(test)]
use std::collections::HashSet;
#[cfg(test)]
use std::sync::{LazyLock, Mutex};

const MAIN_REF: &str = "refs/heads/main";

/// A structured commit message.
///
/// Rendering rules:
///
/// - Subject line: `<domain>:<action>: <summary>`
/// - A blank line, then the trailers `Actor-Id: <id>` and `Care-Location: <location>`
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ClinicCommitMessage {
    domain: RecordDomain,
    action: ChangeAction,
    summary: NonEmptyText,
    actor: ActorId,
    care_location: NonEmptyText,
}

impl ClinicCommitMessage {
    /// Builds the message for a change set.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidCommitMessage`] if the summary is empty or spans lines.
    pub(crate) fn new(meta: &ChangeMeta, care_location: &NonEmptyText) -> StoreResult<Self> {
        let summary = NonEmptyText::single_line(meta.summary).map_err(|e| {
            StoreError::InvalidCommitMessage(format!("summary '{}': {}", meta.summary, e))
        })?;

        Ok(Self {
            domain: meta.domain,
            action: meta.action,
            summary,
            actor: meta.actor,
            care_location: care_location.clone(),
        })
    }

    pub(crate) fn actor(&self) -> ActorId {
        self.actor
    }

    pub(crate) fn render(&self) -> String {
        format!(
            "{}:{}: {}\n\nActor-Id: {}\nCare-Location: {}",
            self.domain,
            self.action,
            self.summary.as_str(),
            self.actor,
            self.care_location.as_str()
        )
    }
}

/// A file to be written and committed.
#[derive(Debug, Clone)]
pub(crate) struct FileToWrite<'a> {
    /// Path relative to the record directory.
    pub relative_path: &'a Path,
    pub content: &'a str,
    /// Previous content, restored on rollback. `None` if the file is new.
    pub old_content: Option<&'a str>,
}

/// Git operations on one record repository rooted at `workdir`.
pub(crate) struct VersionedFileService {
    repo: git2::Repository,
    workdir: PathBuf,
}

impl VersionedFileService {
    /// Initialises a new repository at `workdir`.
    pub(crate) fn init(workdir: &Path) -> StoreResult<Self> {
        let repo = git2::Repository::init(workdir).map_err(StoreError::GitInit)?;
        // git2 may canonicalise the path; use its view so prefix stripping works.
        let actual_workdir = repo
            .workdir()
            .ok_or_else(|| {
                StoreError::GitInit(git2::Error::from_str("repository has no working directory"))
            })?
            .to_path_buf();
        Ok(Self {
            repo,
            workdir: actual_workdir,
        })
    }

    /// Opens the repository at exactly `workdir`, never searching parent directories.
    pub(crate) fn open(workdir: &Path) -> StoreResult<Self> {
        let repo = git2::Repository::open_ext(
            workdir,
            git2::RepositoryOpenFlags::NO_SEARCH,
            std::iter::empty::<&std::ffi::OsStr>(),
        )
        .map_err(StoreError::GitOpen)?;
        let actual_workdir = repo
            .workdir()
            .ok_or_else(|| {
                StoreError::GitOpen(git2::Error::from_str("repository has no working directory"))
            })?
            .to_path_buf();
        Ok(Self {
            repo,
            workdir: actual_workdir,
        })
    }

    /// Number of commits reachable from `HEAD`. Zero for an unborn branch.
    pub(crate) fn commit_count(&self) -> StoreResult<usize> {
        let parents = self.resolve_head_parents()?;
        let Some(head) = parents.into_iter().next() else {
            return Ok(0);
        };
        let mut count = 1;
        let mut current = head;
        while let Ok(parent) = current.parent(0) {
            count += 1;
            current = parent;
        }
        Ok(count)
    }

    fn ensure_main_head(&self) -> StoreResult<()> {
        self.repo
            .set_head(MAIN_REF)
            .map_err(StoreError::GitSetHead)?;
        Ok(())
    }

    /// Writes `files` under the existing repository at `repo_path` and commits them together.
    ///
    /// On failure, files that existed are restored, new files are removed and directories
    /// created by this call are removed again.
    pub(crate) fn write_and_commit_files(
        repo_path: &Path,
        message: &ClinicCommitMessage,
        files: &[FileToWrite],
    ) -> StoreResult<()> {
        let repo = Self::open(repo_path)?;

        let mut created_dirs: Vec<PathBuf> = Vec::new();
        let mut written_files: Vec<(PathBuf, Option<String>)> = Vec::new();

        let result: StoreResult<()> = (|| {
            let mut dirs_needed = std::collections::HashSet::new();
            for file in files {
                let full_path = repo.workdir.join(file.relative_path);
                if let Some(parent) = full_path.parent() {
                    let mut current = parent;
                    while current != repo.workdir && !current.exists() {
                        dirs_needed.insert(current.to_path_buf());
                        match current.parent() {
                            Some(up) => current = up,
                            None => break,
                        }
                    }
                }
            }

            // Shallowest first.
            let mut dirs_to_create: Vec<PathBuf> = dirs_needed.into_iter().collect();
            dirs_to_create.sort_by_key(|p| p.components().count());

            for dir in &dirs_to_create {
                std::fs::create_dir(dir).map_err(StoreError::DirCreation)?;
                created_dirs.push(dir.clone());
            }

            for file in files {
                let full_path = repo.workdir.join(file.relative_path);
                write_file_atomically(&full_path, file.content).map_err(StoreError::FileWrite)?;
                written_files.push((full_path, file.old_content.map(str::to_owned)));
            }

            let paths: Vec<PathBuf> = files
                .iter()
                .map(|f| f.relative_path.to_path_buf())
                .collect();
            repo.commit_paths(message, &paths)?;

            Ok(())
        })();

        if let Err(write_error) = result {
            for (full_path, old_content) in written_files.iter().rev() {
                let restored = match old_content {
                    Some(contents) => write_file_atomically(full_path, contents),
                    None => std::fs::remove_file(full_path),
                };
                if let Err(e) = restored {
                    tracing::error!("failed to roll back {}: {}", full_path.display(), e);
                }
            }
            for dir in created_dirs.iter().rev() {
                let _ = std::fs::remove_dir(dir);
            }
            return Err(write_error);
        }

        Ok(())
    }

    /// Initialises a repository at `record_dir`, writes `files` and makes the first commit.
    ///
    /// If any step fails the whole `record_dir` is removed. If that removal also fails,
    /// [`StoreError::CleanupAfterInitialiseFailed`] carries both errors.
    pub(crate) fn init_and_commit(
        record_dir: &Path,
        message: &ClinicCommitMessage,
        files: &[FileToWrite],
    ) -> StoreResult<()> {
        let result: StoreResult<()> = (|| {
            let _repo = Self::init(record_dir)?;
            Self::write_and_commit_files(record_dir, message, files)
        })();

        match result {
            Ok(()) => Ok(()),
            Err(init_error) => {
                if let Err(cleanup_error) = cleanup_record_dir(record_dir) {
                    return Err(StoreError::CleanupAfterInitialiseFailed {
                        path: record_dir.to_path_buf(),
                        init_error: Box::new(init_error),
                        cleanup_error,
                    });
                }
                Err(init_error)
            }
        }
    }

    /// Stages exactly `relative_paths` on top of `HEAD` and commits them.
    ///
    /// The index is rebuilt from the `HEAD` tree first and only written back to disk once the
    /// commit exists, so entries staged by a failed attempt never reach a later commit.
    ///
    /// Absolute paths under the workdir are accepted and made relative. Paths containing `..`
    /// are rejected.
    fn commit_paths(
        &self,
        message: &ClinicCommitMessage,
        relative_paths: &[PathBuf],
    ) -> StoreResult<git2::Oid> {
        self.ensure_main_head()?;
        let mut index = self.repo.index().map_err(StoreError::GitIndex)?;
        match self.resolve_head_parents()?.first() {
            Some(head) => {
                let tree = head.tree().map_err(StoreError::GitFindTree)?;
                index.read_tree(&tree).map_err(StoreError::GitIndex)?;
            }
            None => index.clear().map_err(StoreError::GitIndex)?,
        }

        for path in relative_paths {
            let rel = if path.is_absolute() {
                path.strip_prefix(&self.workdir)
                    .map_err(|_| {
                        StoreError::InvalidPath(format!(
                            "{} is outside the record directory",
                            path.display()
                        ))
                    })?
                    .to_path_buf()
            } else {
                path.to_path_buf()
            };

            if rel.components().any(|c| matches!(c, Component::ParentDir)) {
                return Err(StoreError::InvalidPath(format!(
                    "{} contains a parent directory reference",
                    rel.display()
                )));
            }

            index.add_path(&rel).map_err(StoreError::GitAdd)?;
        }

        let oid = self.commit_from_index(message, &mut index)?;
        if let Err(e) = index.write() {
            // Rebuilt from HEAD on the next commit.
            tracing::warn!("failed to write index in {}: {}", self.workdir.display(), e);
        }
        Ok(oid)
    }

    fn commit_from_index(
        &self,
        message: &ClinicCommitMessage,
        index: &mut git2::Index,
    ) -> StoreResult<git2::Oid> {
        #[cfg(test)]
        if take_forced_commit_failure() {
            return Err(StoreError::GitCommit(git2::Error::from_str(
                "forced commit failure (test hook)",
            )));
        }

        let tree_id = index.write_tree().map_err(StoreError::GitWriteTree)?;
        let tree = self
            .repo
            .find_tree(tree_id)
            .map_err(StoreError::GitFindTree)?;

        let actor = message.actor().to_string();
        let email = format!("{}@{}", actor, COMMIT_EMAIL_DOMAIN);
        let sig = git2::Signature::now(&actor, &email).map_err(StoreError::GitSignature)?;

        let parents = self.resolve_head_parents()?;
        let parent_refs: Vec<&git2::Commit> = parents.iter().collect();
        self.repo
            .commit(
                Some("HEAD"),
                &sig,
                &sig,
                &message.render(),
                &tree,
                &parent_refs,
            )
            .map_err(StoreError::GitCommit)
    }

    /// The current `HEAD` commit as a parent list; empty before the first commit.
    fn resolve_head_parents(&self) -> StoreResult<Vec<git2::Commit<'_>>> {
        match self.repo.head() {
            Ok(head) => {
                let commit = head.peel_to_commit().map_err(StoreError::GitPeel)?;
                Ok(vec![commit])
            }
            Err(e) if e.code() == git2::ErrorCode::UnbornBranch => Ok(vec![]),
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(vec![]),
            Err(e) => Err(StoreError::GitHead(e)),
        }
    }
}

#[cfg(test)]
static FORCE_CLEANUP_ERROR_FOR_THREADS: LazyLock<Mutex<HashSet<std::thread::ThreadId>>> =
    LazyLock::new(|| Mutex::new(HashSet::new()));

#[cfg(test)]
static FORCE_COMMIT_ERROR_FOR_THREADS: LazyLock<Mutex<HashSet<std::thread::ThreadId>>> =
    LazyLock::new(|| Mutex::new(HashSet::new()));

/// Makes the next commit attempted on the current thread fail.
#[cfg(test)]
pub(crate) fn force_commit_failure_on_this_thread() {
    FORCE_COMMIT_ERROR_FOR_THREADS
        .lock()
        .expect("FORCE_COMMIT_ERROR_FOR_THREADS mutex poisoned")
        .insert(std::thread::current().id());
}

#[cfg(test)]
fn take_forced_commit_failure() -> bool {
    FORCE_COMMIT_ERROR_FOR_THREADS
        .lock()
        .expect("FORCE_COMMIT_ERROR_FOR_THREADS mutex poisoned")
        .remove(&std::thread::current().id())
}

/// Replaces `path` with `content` through a hidden sibling temp file and a rename, so readers
/// see either the old file or the new one.
fn write_file_atomically(path: &Path, content: &str) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| std::io::Error::other(format!("{} has no file name", path.display())))?;
    let temp_path = path.with_file_name(format!(".{}.tmp", file_name.to_string_lossy()));

    let result = (|| {
        let mut file = std::fs::File::create(&temp_path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        std::fs::rename(&temp_path, path)
    })();
    if result.is_err() {
        let _ = std::fs::remove_file(&temp_path);
    }
    result
}

fn cleanup_record_dir(record_dir: &Path) -> std::io::Result<()> {
    #[cfg(test)]
    {
        let current_id = std::thread::current().id();
        let mut guard = FORCE_CLEANUP_ERROR_FOR_THREADS
            .lock()
            .expect("FORCE_CLEANUP_ERROR_FOR_THREADS mutex poisoned");

        if guard.remove(&current_id) {
            return Err(std::io::Error::other("forced cleanup failure (test hook)"));
        }
    }

    std::fs::remove_dir_all(record_dir)
}
