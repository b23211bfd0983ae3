use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use rapport_entities::{
    AllocationSeed, Chat, ChatId, EntityContext, EntityError, Message, MessageId, PATIENTS, Party,
    Patient, PatientId, RapportSettings, Request, RequestId, RequestStatus, SettingsStore,
    THERAPISTS, Therapist, TherapistId,
};
use rapport_storage::{Document, SqliteDocumentStore, StorageError};
use serde_json::Value;
use snafu::{OptionExt, ResultExt, Snafu};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
struct RunnerArgs {
    scenario: Scenario,
    db_path: Option<String>,
    settings_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy)]
enum Scenario {
    IdRoundtrip,
    IdInvalid,
    SchemaInit,
    RequestLifecycle,
    DuplicateRequest,
    ChatSync,
    RecentBounds,
    All,
}

impl Scenario {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "id_roundtrip" => Some(Self::IdRoundtrip),
            "id_invalid" => Some(Self::IdInvalid),
            "schema_init" => Some(Self::SchemaInit),
            "request_lifecycle" => Some(Self::RequestLifecycle),
            "duplicate_request" => Some(Self::DuplicateRequest),
            "chat_sync" => Some(Self::ChatSync),
            "recent_bounds" => Some(Self::RecentBounds),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::IdRoundtrip => "id_roundtrip",
            Self::IdInvalid => "id_invalid",
            Self::SchemaInit => "schema_init",
            Self::RequestLifecycle => "request_lifecycle",
            Self::DuplicateRequest => "duplicate_request",
            Self::ChatSync => "chat_sync",
            Self::RecentBounds => "recent_bounds",
            Self::All => "all",
        }
    }
}

#[derive(Debug, Snafu)]
enum RunnerError {
    #[snafu(display("missing required --scenario argument"))]
    MissingScenario { stage: &'static str },
    #[snafu(display("missing value for argument '{arg}'"))]
    MissingArgumentValue {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("unknown scenario '{raw}'"))]
    UnknownScenario { stage: &'static str, raw: String },
    #[snafu(display("unknown argument '{raw}'"))]
    UnknownArgument { stage: &'static str, raw: String },
    #[snafu(display("missing required --db argument for scenario '{scenario}'"))]
    MissingDbPath {
        stage: &'static str,
        scenario: &'static str,
    },
    #[snafu(display("storage validation failed: {source}"))]
    StorageValidation {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("entity operation failed: {source}"))]
    EntityOperation {
        stage: &'static str,
        source: EntityError,
    },
    #[snafu(display("sqlite query failed: {source}"))]
    SqliteQuery {
        stage: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("scenario '{scenario}' failed: {reason}"))]
    ScenarioFailed {
        stage: &'static str,
        scenario: &'static str,
        reason: String,
    },
    #[snafu(display("file operation failed at '{path}': {source}"))]
    FileIo {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
}

type RunnerResult<T> = Result<T, RunnerError>;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run().await {
        println!("runner_ok=false");
        eprintln!("runner_error={error}");
        std::process::exit(1);
    }
}

async fn run() -> RunnerResult<()> {
    let args = parse_args(env::args().skip(1))?;
    println!("scenario={}", args.scenario.name());
    if let Some(db_path) = args.db_path.as_deref() {
        println!("db_path={db_path}");
    }

    match args.scenario {
        Scenario::IdRoundtrip => run_id_roundtrip(),
        Scenario::IdInvalid => run_id_invalid(),
        Scenario::SchemaInit => run_schema_init(require_db_path(&args, "schema_init")?).await,
        Scenario::RequestLifecycle => {
            let settings = runner_settings(&args, "request_lifecycle")?;
            run_request_lifecycle(&settings).await
        }
        Scenario::DuplicateRequest => {
            let settings = runner_settings(&args, "duplicate_request")?;
            run_duplicate_request(&settings).await
        }
        Scenario::ChatSync => {
            let settings = runner_settings(&args, "chat_sync")?;
            run_chat_sync(&settings).await
        }
        Scenario::RecentBounds => {
            let settings = runner_settings(&args, "recent_bounds")?;
            run_recent_bounds(&settings).await
        }
        Scenario::All => run_all(&args).await,
    }
}

fn parse_args(args: impl IntoIterator<Item = String>) -> RunnerResult<RunnerArgs> {
    let mut scenario = None;
    let mut db_path = None;
    let mut settings_path = None;
    let mut pending = args.into_iter();

    while let Some(argument) = pending.next() {
        match argument.as_str() {
            "--scenario" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-scenario-value",
                    arg: "--scenario",
                })?;

                let parsed = Scenario::parse(&value).context(UnknownScenarioSnafu {
                    stage: "parse-args-scenario",
                    raw: value,
                })?;
                scenario = Some(parsed);
            }
            "--db" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-db-value",
                    arg: "--db",
                })?;
                db_path = Some(value);
            }
            "--settings" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-settings-value",
                    arg: "--settings",
                })?;
                settings_path = Some(PathBuf::from(value));
            }
            _ => {
                return UnknownArgumentSnafu {
                    stage: "parse-args",
                    raw: argument,
                }
                .fail();
            }
        }
    }

    Ok(RunnerArgs {
        scenario: scenario.context(MissingScenarioSnafu {
            stage: "parse-args-scenario-required",
        })?,
        db_path,
        settings_path,
    })
}

async fn run_all(args: &RunnerArgs) -> RunnerResult<()> {
    run_id_roundtrip()?;
    run_id_invalid()?;

    if let Some(path) = args.db_path.as_deref() {
        run_schema_init(path).await?;
        let settings = runner_settings(args, "all")?;
        run_request_lifecycle(&settings).await?;
        run_duplicate_request(&settings).await?;
        run_chat_sync(&settings).await?;
        run_recent_bounds(&settings).await?;
    }

    println!("all_passed=true");
    Ok(())
}

fn run_id_roundtrip() -> RunnerResult<()> {
    let seed = AllocationSeed::for_pair("patient@example.com", "therapist@example.com");
    let raw = rapport_entities::candidate_key(&seed, 42);
    assert_id_roundtrip("patient_id", PatientId::from(raw))?;
    assert_id_roundtrip("therapist_id", TherapistId::from(raw))?;
    assert_id_roundtrip("chat_id", ChatId::from(raw))?;
    assert_id_roundtrip("message_id", MessageId::from(raw))?;
    assert_id_roundtrip("request_id", RequestId::from(raw))?;
    println!("id_roundtrip=true");
    println!("runner_ok=true");
    Ok(())
}

fn run_id_invalid() -> RunnerResult<()> {
    let invalid_input = "not-a-valid-uuid";
    let invalid_id_error = invalid_input_is_rejected::<PatientId>(invalid_input)
        && invalid_input_is_rejected::<TherapistId>(invalid_input)
        && invalid_input_is_rejected::<ChatId>(invalid_input)
        && invalid_input_is_rejected::<MessageId>(invalid_input)
        && invalid_input_is_rejected::<RequestId>(invalid_input);

    println!("invalid_id_error={invalid_id_error}");
    if !invalid_id_error {
        return ScenarioFailedSnafu {
            stage: "scenario-id-invalid",
            scenario: "id_invalid",
            reason: "at least one ID wrapper accepted malformed UUID input".to_string(),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_schema_init(db_path: &str) -> RunnerResult<()> {
    reset_sqlite_files(db_path)?;
    let store = SqliteDocumentStore::open(db_path)
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-schema-init-open",
        })?;

    let tables = sqlx::query_scalar::<_, String>(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'documents'",
    )
    .fetch_all(store.pool())
    .await
    .context(SqliteQuerySnafu {
        stage: "scenario-schema-init-list-tables",
    })?;

    let documents_table = tables.iter().any(|name| name == "documents");
    println!("documents_table={documents_table}");
    if !documents_table {
        return ScenarioFailedSnafu {
            stage: "scenario-schema-init-verify",
            scenario: "schema_init",
            reason: "documents table missing after migration".to_string(),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_request_lifecycle(settings: &RapportSettings) -> RunnerResult<()> {
    let context = fresh_context(settings).await?;
    let (patient, therapist) = register_pair(&context, "request_lifecycle")?;

    let request = Request::create(&context, &patient, &therapist, "anxiety support").context(
        EntityOperationSnafu {
            stage: "scenario-request-create",
        },
    )?;
    let initial = read_status(&request)?;
    println!("initial_status={initial:?}");

    request.accept(Party::Therapist).context(EntityOperationSnafu {
        stage: "scenario-request-therapist-accept",
    })?;
    let after_therapist = read_status(&request)?;
    println!("after_therapist_status={after_therapist:?}");

    request.accept(Party::Patient).context(EntityOperationSnafu {
        stage: "scenario-request-patient-accept",
    })?;
    let reloaded = Request::load(&context, request.id()).context(EntityOperationSnafu {
        stage: "scenario-request-reload",
    })?;
    let snapshot = reloaded.refresh().context(EntityOperationSnafu {
        stage: "scenario-request-refresh",
    })?;
    println!("final_status={:?}", snapshot.status());
    println!("summary={}", snapshot.summary().unwrap_or_default());

    let expected = initial == RequestStatus::Pending
        && after_therapist == RequestStatus::Pending
        && snapshot.status() == RequestStatus::Accepted
        && snapshot.summary() == Some("anxiety support");
    if !expected {
        return ScenarioFailedSnafu {
            stage: "scenario-request-verify",
            scenario: "request_lifecycle",
            reason: "vote sequence did not end accepted".to_string(),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_duplicate_request(settings: &RapportSettings) -> RunnerResult<()> {
    let context = fresh_context(settings).await?;
    let (patient, therapist) = register_pair(&context, "duplicate_request")?;

    Request::create(&context, &patient, &therapist, "first").context(EntityOperationSnafu {
        stage: "scenario-duplicate-first",
    })?;
    let duplicate_rejected = matches!(
        Request::create(&context, &patient, &therapist, "second"),
        Err(EntityError::DuplicateRequest { .. })
    );
    println!("duplicate_rejected={duplicate_rejected}");

    let inbox = Request::ids_for_therapist(&context, therapist.id()).context(EntityOperationSnafu {
        stage: "scenario-duplicate-inbox",
    })?;
    println!("therapist_requests={}", inbox.len());

    if !duplicate_rejected || inbox.len() != 1 {
        return ScenarioFailedSnafu {
            stage: "scenario-duplicate-verify",
            scenario: "duplicate_request",
            reason: "second request for the same pair was not rejected".to_string(),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_chat_sync(settings: &RapportSettings) -> RunnerResult<()> {
    let context = fresh_context(settings).await?;
    let (patient, therapist) = register_pair(&context, "chat_sync")?;

    let mut chat = Chat::create(&context, &patient, &therapist).context(EntityOperationSnafu {
        stage: "scenario-chat-create",
    })?;

    let lines = [
        (Party::Patient, "hello"),
        (Party::Therapist, "hi, how are you feeling today?"),
        (Party::Patient, "a bit better"),
    ];
    for (sender, content) in lines {
        let message = Message::create(&context, &patient, &therapist, sender, content).context(
            EntityOperationSnafu {
                stage: "scenario-chat-message-create",
            },
        )?;
        chat.add_message(message);
    }
    println!("pending_before_sync={}", chat.pending_message_count());
    chat.update_collection().context(EntityOperationSnafu {
        stage: "scenario-chat-update",
    })?;

    let reloaded = Chat::load(&context, chat.id()).context(EntityOperationSnafu {
        stage: "scenario-chat-reload",
    })?;
    let same_order = reloaded.messages() == chat.messages();
    println!("reloaded_messages={}", reloaded.messages().len());
    println!("same_order={same_order}");

    if !same_order {
        return ScenarioFailedSnafu {
            stage: "scenario-chat-verify",
            scenario: "chat_sync",
            reason: "reloaded chat differs from the synced one".to_string(),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_recent_bounds(settings: &RapportSettings) -> RunnerResult<()> {
    let context = fresh_context(settings).await?;
    let (patient, therapist) = register_pair(&context, "recent_bounds")?;

    let mut chat = Chat::create(&context, &patient, &therapist).context(EntityOperationSnafu {
        stage: "scenario-recent-create",
    })?;
    let message = Message::create(&context, &patient, &therapist, Party::Patient, "only one")
        .context(EntityOperationSnafu {
            stage: "scenario-recent-message",
        })?;
    chat.add_message(message);

    let overdraw_rejected = matches!(
        chat.recent_messages(2),
        Err(EntityError::NotEnoughMessages { .. })
    );
    println!("overdraw_rejected={overdraw_rejected}");
    if !overdraw_rejected {
        return ScenarioFailedSnafu {
            stage: "scenario-recent-verify",
            scenario: "recent_bounds",
            reason: "asking for more messages than stored did not fail".to_string(),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

fn runner_settings(args: &RunnerArgs, scenario: &'static str) -> RunnerResult<RapportSettings> {
    let db_path = require_db_path(args, scenario)?;
    let mut settings = match args.settings_path.clone() {
        Some(path) => SettingsStore::new(path).settings().as_ref().clone(),
        None => RapportSettings::default(),
    };
    settings.database_location = db_path.to_string();
    Ok(settings)
}

async fn fresh_context(settings: &RapportSettings) -> RunnerResult<EntityContext> {
    reset_sqlite_files(&settings.database_location)?;
    EntityContext::open_sqlite(settings)
        .await
        .context(EntityOperationSnafu {
            stage: "scenario-open-context",
        })
}

/// Writes one patient and one therapist record the way the registration flow would.
fn register_pair(context: &EntityContext, scenario: &str) -> RunnerResult<(Patient, Therapist)> {
    let patient_email = format!("patient+{scenario}@example.com");
    let therapist_email = format!("therapist+{scenario}@example.com");
    let patient_id = register_party(context, PATIENTS, &patient_email, "Pat Example")?;
    let therapist_id = register_party(context, THERAPISTS, &therapist_email, "Dr. Example")?;

    let patient = Patient::load(context, PatientId::from(patient_id)).context(EntityOperationSnafu {
        stage: "scenario-load-patient",
    })?;
    let therapist =
        Therapist::load(context, TherapistId::from(therapist_id)).context(EntityOperationSnafu {
            stage: "scenario-load-therapist",
        })?;
    Ok((patient, therapist))
}

fn register_party(
    context: &EntityContext,
    collection: &str,
    email: &str,
    full_name: &str,
) -> RunnerResult<rapport_storage::DocumentId> {
    let id = context
        .allocator()
        .allocate(context.store(), collection, &AllocationSeed::new(email))
        .context(StorageValidationSnafu {
            stage: "scenario-register-allocate",
        })?;

    let mut fields = Document::new();
    fields.insert("email".to_string(), Value::from(email));
    fields.insert("full_name".to_string(), Value::from(full_name));
    context
        .store()
        .set_fields(collection, id, fields)
        .context(StorageValidationSnafu {
            stage: "scenario-register-populate",
        })?;
    Ok(id)
}

fn read_status(request: &Request) -> RunnerResult<RequestStatus> {
    request.status().context(EntityOperationSnafu {
        stage: "scenario-request-status",
    })
}

fn reset_sqlite_files(db_path: &str) -> RunnerResult<()> {
    remove_file_if_exists(Path::new(db_path), "scenario-reset-sqlite-db")?;
    let wal_path = format!("{db_path}-wal");
    remove_file_if_exists(Path::new(&wal_path), "scenario-reset-sqlite-wal")?;
    let shm_path = format!("{db_path}-shm");
    remove_file_if_exists(Path::new(&shm_path), "scenario-reset-sqlite-shm")?;
    Ok(())
}

fn remove_file_if_exists(path: &Path, stage: &'static str) -> RunnerResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(RunnerError::FileIo {
            stage,
            path: path.display().to_string(),
            source,
        }),
    }
}

fn assert_id_roundtrip<T>(label: &'static str, id: T) -> RunnerResult<()>
where
    T: Copy + Eq + FromStr<Err = StorageError> + std::fmt::Display,
{
    let encoded = id.to_string();
    let decoded = encoded.parse::<T>().context(StorageValidationSnafu {
        stage: "scenario-id-roundtrip-parse",
    })?;

    if decoded != id {
        return ScenarioFailedSnafu {
            stage: "scenario-id-roundtrip-compare",
            scenario: "id_roundtrip",
            reason: format!("{label} parse/format roundtrip mismatch"),
        }
        .fail();
    }

    println!("{label}_roundtrip=true");
    Ok(())
}

fn invalid_input_is_rejected<T>(raw: &str) -> bool
where
    T: FromStr<Err = StorageError>,
{
    matches!(raw.parse::<T>(), Err(StorageError::InvalidId { .. }))
}

fn require_db_path<'a>(args: &'a RunnerArgs, scenario: &'static str) -> RunnerResult<&'a str> {
    args.db_path.as_deref().context(MissingDbPathSnafu {
        stage: "require-db-path",
        scenario,
    })
}
