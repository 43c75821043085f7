use clap::{Args, Parser, Subcommand};
use clinic_core::episodes::parse_scheduled_at;
use clinic_core::patients::parse_birth_date;
use clinic_core::{
    Actor, ActorId, ClinicServices, CoreConfig, EncounterFilter, NewEncounter, NewEpisode,
    NewPatient, RequestContext, SoapInput,
};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "clinic")]
#[command(about = "Clinic records CLI")]
struct Cli {
    /// Acting user id (canonical UUID)
    #[arg(long, global = true)]
    actor_id: Option<String>,
    /// Role held by the acting user; repeat for several
    #[arg(long = "role", global = true)]
    roles: Vec<String>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a patient
    CreatePatient {
        full_name: String,
        /// Phone number, normalised to E.164
        phone: String,
        #[arg(long)]
        gender: Option<String>,
        /// Date of birth (YYYY-MM-DD)
        #[arg(long)]
        dob: Option<String>,
    },
    /// List all patients
    ListPatients,
    /// Open a surgical episode for a patient
    CreateEpisode {
        patient_id: String,
        procedure_name: String,
        /// planned, scheduled, done or cancelled
        #[arg(long, default_value = "planned")]
        status: String,
        /// RFC 3339 timestamp, e.g. 2026-11-02T08:30:00Z
        #[arg(long)]
        scheduled_at: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    /// List episodes, optionally of one patient
    ListEpisodes {
        #[arg(long)]
        patient_id: Option<String>,
    },
    /// Show who the CLI is acting as
    Whoami,
    /// Open an encounter with an empty draft
    CreateEncounter {
        patient_id: String,
        #[arg(long)]
        episode_id: Option<String>,
        #[arg(long)]
        appointment_id: Option<String>,
        /// consultation, follow_up, pre_op, post_op or other
        #[arg(long, default_value = "consultation")]
        note_type: String,
    },
    /// Show an encounter with its current version and history
    ShowEncounter { encounter_id: String },
    /// List encounters
    ListEncounters {
        #[arg(long)]
        patient_id: Option<String>,
        #[arg(long)]
        episode_id: Option<String>,
        #[arg(long)]
        status: Option<String>,
    },
    /// Save the draft of an encounter
    SaveDraft {
        encounter_id: String,
        #[command(flatten)]
        soap: SoapArgs,
    },
    /// Finalize an encounter (doctor or admin)
    Finalize { encounter_id: String },
    /// Start a new draft version of a finalized encounter
    NewVersion { encounter_id: String },
}

#[derive(Args)]
struct SoapArgs {
    #[arg(long, default_value = "")]
    chief_complaint: String,
    #[arg(long, default_value = "")]
    history: String,
    #[arg(long, default_value = "")]
    exam: String,
    #[arg(long, default_value = "")]
    assessment: String,
    #[arg(long, default_value = "")]
    plan: String,
}

impl From<SoapArgs> for SoapInput {
    fn from(a: SoapArgs) -> Self {
        Self {
            chief_complaint: a.chief_complaint,
            history: a.history,
            exam: a.exam,
            assessment: a.assessment,
            plan: a.plan,
        }
    }
}

fn request_context(
    actor_id: Option<&str>,
    roles: &[String],
) -> Result<RequestContext, Box<dyn std::error::Error>> {
    let Some(raw) = actor_id else {
        return Ok(RequestContext::anonymous());
    };
    let actor = Actor::from_role_names(raw.parse::<ActorId>()?, roles.iter().map(String::as_str));
    Ok(RequestContext::authenticated(actor))
}

fn describe_actor(ctx: &RequestContext) -> String {
    match ctx.actor() {
        Some(actor) => match actor.primary_role() {
            Some(role) => format!("Acting as {} ({})", actor.id(), role),
            None => format!("Acting as {} (no role)", actor.id()),
        },
        None => "Not authenticated; pass --actor-id".to_string(),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let Some(command) = cli.command else {
        println!("Use 'clinic --help' for commands");
        return Ok(());
    };

    let cfg = CoreConfig::from_env_values(
        std::env::var("CLINIC_DATA_DIR").ok(),
        std::env::var("CLINIC_CARE_LOCATION").ok(),
        std::env::var("CLINIC_STORE").ok(),
    )?;
    let services = ClinicServices::open(Arc::new(cfg))?;
    let ctx = request_context(cli.actor_id.as_deref(), &cli.roles)?;

    match command {
        Commands::CreatePatient {
            full_name,
            phone,
            gender,
            dob,
        } => {
            let input = NewPatient {
                full_name,
                phone,
                gender: gender.map(|g| g.parse()).transpose()?,
                date_of_birth: dob.as_deref().map(parse_birth_date).transpose()?,
            };
            let id = services.patients.create_patient(&ctx, input)?;
            println!("Registered patient with ID: {}", id);
        }
        Commands::ListPatients => {
            let patients = services.patients.list_patients(&ctx)?;
            if patients.is_empty() {
                println!("No patients found.");
            }
            for p in patients {
                println!(
                    "ID: {}, Name: {}, Phone: {}, Created: {}",
                    p.id, p.full_name, p.phone_e164, p.created_at
                );
            }
        }
        Commands::CreateEpisode {
            patient_id,
            procedure_name,
            status,
            scheduled_at,
            notes,
        } => {
            let input = NewEpisode {
                patient_id: patient_id.parse()?,
                procedure_name,
                status: status.parse()?,
                scheduled_at: scheduled_at.as_deref().map(parse_scheduled_at).transpose()?,
                notes,
            };
            let id = services.episodes.create_episode(&ctx, input)?;
            println!("Opened episode with ID: {}", id);
        }
        Commands::ListEpisodes { patient_id } => {
            let patient_id = patient_id.map(|p| p.parse()).transpose()?;
            let episodes = services.episodes.list_episodes(&ctx, patient_id)?;
            if episodes.is_empty() {
                println!("No episodes found.");
            }
            for e in episodes {
                let scheduled = e
                    .scheduled_at
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "unscheduled".into());
                println!(
                    "ID: {}, Patient: {}, Procedure: {}, Status: {}, Scheduled: {}",
                    e.id, e.patient_id, e.procedure_name, e.status, scheduled
                );
            }
        }
        Commands::Whoami => println!("{}", describe_actor(&ctx)),
        Commands::CreateEncounter {
            patient_id,
            episode_id,
            appointment_id,
            note_type,
        } => {
            let input = NewEncounter {
                patient_id: patient_id.parse()?,
                episode_id: episode_id.map(|e| e.parse()).transpose()?,
                appointment_id: appointment_id.map(|a| a.parse()).transpose()?,
                note_type: note_type.parse()?,
            };
            let id = services.encounters.create_encounter(&ctx, input)?;
            println!("Opened encounter with ID: {}", id);
        }
        Commands::ShowEncounter { encounter_id } => {
            let detail = services
                .encounters
                .get_encounter(&ctx, encounter_id.parse()?)?;
            let e = &detail.encounter;
            println!("Encounter {} ({}, {})", e.id, e.note_type, e.status);
            println!("Patient: {}", e.patient_id);
            if let Some(v) = &detail.current_version {
                println!("Current version {} ({})", v.version_no, v.status);
                for (label, text) in [
                    ("Chief complaint", &v.content.chief_complaint),
                    ("History", &v.content.history),
                    ("Exam", &v.content.exam),
                    ("Assessment", &v.content.assessment),
                    ("Plan", &v.content.plan),
                ] {
                    if !text.is_empty() {
                        println!("  {}: {}", label, text);
                    }
                }
            }
            for v in &detail.versions {
                match &v.finalized_by {
                    Some(by) => println!("  v{} {} by {}", v.version_no, v.status, by),
                    None => println!("  v{} {}", v.version_no, v.status),
                }
            }
        }
        Commands::ListEncounters {
            patient_id,
            episode_id,
            status,
        } => {
            let filter = EncounterFilter {
                patient_id: patient_id.map(|p| p.parse()).transpose()?,
                episode_id: episode_id.map(|e| e.parse()).transpose()?,
                status: status.map(|s| s.parse()).transpose()?,
            };
            for e in services.encounters.list_encounters(&ctx, &filter)? {
                println!(
                    "ID: {}, Patient: {}, Type: {}, Status: {}, Updated: {}",
                    e.id, e.patient_id, e.note_type, e.status, e.updated_at
                );
            }
        }
        Commands::SaveDraft { encounter_id, soap } => {
            let version_id =
                services
                    .encounters
                    .save_draft(&ctx, encounter_id.parse()?, soap.into())?;
            println!("Saved draft version {}", version_id);
        }
        Commands::Finalize { encounter_id } => {
            services
                .encounters
                .finalize_encounter(&ctx, encounter_id.parse()?)?;
            println!("Finalized encounter {}", encounter_id);
        }
        Commands::NewVersion { encounter_id } => {
            let version_id = services
                .encounters
                .create_new_version(&ctx, encounter_id.parse()?)?;
            println!("Started draft version {}", version_id);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACTOR: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn actor_is_described_by_primary_role() {
        let roles = ["nurse".to_string(), "doctor".to_string()];
        let ctx = request_context(Some(ACTOR), &roles).unwrap();
        assert_eq!(describe_actor(&ctx), format!("Acting as {} (doctor)", ACTOR));

        let ctx = request_context(Some(ACTOR), &[]).unwrap();
        assert_eq!(describe_actor(&ctx), format!("Acting as {} (no role)", ACTOR));

        let ctx = request_context(None, &[]).unwrap();
        assert!(describe_actor(&ctx).starts_with("Not authenticated"));
    }

    #[test]
    fn malformed_actor_id_is_rejected() {
        assert!(request_context(Some("ada"), &[]).is_err());
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
