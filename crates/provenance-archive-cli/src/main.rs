use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use provenance_archive_core::{
    import_archive, ArchiveReader, CommentMode, ConflictChoice, EntityKind, ExtrasConflictResolver,
    ExtrasMode, ImportError, ImportOptions, ImportReport, JsonArchive, NewExtrasMode,
};
use provenance_archive_store_sqlite::{FsRepository, SqliteStore, DEFAULT_OWNER_EMAIL};
use serde_json::{json, Map, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const DEFAULT_LOG_FILTER: &str = "parc=info,provenance_archive_core=info";

#[derive(Debug, Parser)]
#[command(name = "parc")]
#[command(about = "Provenance archive importer")]
struct Cli {
    #[arg(long, default_value = "./provenance.sqlite3")]
    db: PathBuf,

    /// Owner of groups created by imports.
    #[arg(long, default_value = DEFAULT_OWNER_EMAIL)]
    owner_email: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Archive {
        #[command(subcommand)]
        command: ArchiveCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate,
    IntegrityCheck,
}

#[derive(Debug, Subcommand)]
enum ArchiveCommand {
    Inspect(ArchiveInspectArgs),
    Import(ArchiveImportArgs),
}

#[derive(Debug, Args)]
struct ArchiveInspectArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Args)]
struct ArchiveImportArgs {
    /// Extracted archive folder holding `metadata.json` and `data.json`.
    #[arg(long = "in")]
    input: PathBuf,
    /// Root of the node file repository.
    #[arg(long, default_value = "./repository")]
    repository: PathBuf,
    /// Group receiving every imported node; a timestamped one is made when unset.
    #[arg(long)]
    group: Option<String>,
    #[arg(long, default_value_t = false)]
    ignore_unknown_nodes: bool,
    /// Three letters from [k|n][c|n][l|u|d|a].
    #[arg(long, default_value = "kcl")]
    extras_mode_existing: ExtrasMode,
    #[arg(long, default_value = "import")]
    extras_mode_new: NewExtrasMode,
    #[arg(long, default_value = "newest")]
    comment_mode: CommentMode,
    #[arg(long, default_value_t = 1000)]
    batch_size: usize,
}

impl ArchiveImportArgs {
    fn options(&self) -> ImportOptions {
        ImportOptions {
            target_group: self.group.clone(),
            ignore_unknown_nodes: self.ignore_unknown_nodes,
            extras_mode_existing: self.extras_mode_existing,
            extras_mode_new: self.extras_mode_new,
            comment_mode: self.comment_mode,
            batch_size: self.batch_size,
        }
    }
}

/// Asks on the terminal which value of a colliding extra to keep.
struct PromptResolver;

impl ExtrasConflictResolver for PromptResolver {
    fn resolve(
        &mut self,
        key: &str,
        existing: &Value,
        imported: &Value,
    ) -> Result<ConflictChoice, ImportError> {
        ask_choice(key, existing, imported, &mut io::stdin().lock(), &mut io::stderr())
    }
}

/// Prompt until one of `e`, `i` or `d` is answered. End of input keeps the
/// stored value; failing to write the prompt or read the answer aborts.
fn ask_choice(
    key: &str,
    existing: &Value,
    imported: &Value,
    input: &mut dyn BufRead,
    prompt: &mut dyn Write,
) -> Result<ConflictChoice, ImportError> {
    let terminal = |err: io::Error| {
        ImportError::ArchiveImport(format!("could not ask about extra `{key}`: {err}"))
    };
    loop {
        write!(
            prompt,
            "extra `{key}` differs (existing: {existing}, imported: {imported}); \
             keep [e]xisting, use [i]mported or [d]rop? "
        )
        .and_then(|()| prompt.flush())
        .map_err(terminal)?;
        let mut answer = String::new();
        if input.read_line(&mut answer).map_err(terminal)? == 0 {
            return Ok(ConflictChoice::KeepExisting);
        }
        match answer.trim() {
            "e" => return Ok(ConflictChoice::KeepExisting),
            "i" => return Ok(ConflictChoice::UseImported),
            "d" => return Ok(ConflictChoice::Drop),
            _ => writeln!(prompt, "please answer e, i or d").map_err(terminal)?,
        }
    }
}

/// Stamp a command payload with the `parc` output contract version. Non-object
/// payloads are nested under `payload`.
fn stamp_contract(payload: Value) -> Value {
    let mut body = match payload {
        Value::Object(body) => body,
        other => Map::from_iter([("payload".to_string(), other)]),
    };
    body.insert("contract_version".to_string(), Value::from(CLI_CONTRACT_VERSION));
    Value::Object(body)
}

fn print_payload(payload: Value) -> Result<()> {
    let body = serde_json::to_string_pretty(&stamp_contract(payload))
        .context("failed to encode command output")?;
    println!("{body}");
    Ok(())
}

fn error_envelope(err: &anyhow::Error) -> Value {
    let kind = err.downcast_ref::<ImportError>().map_or("internal", ImportError::kind);
    json!({
        "status": "error",
        "error": {
            "kind": kind,
            "message": format!("{err:#}")
        }
    })
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(io::stderr).init();
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let body = serde_json::to_string_pretty(&stamp_contract(error_envelope(&err)))
                .unwrap_or_else(|_| format!("{err:#}"));
            println!("{body}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Db { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_db(command, &mut store)
        }
        Command::Archive { command: ArchiveCommand::Inspect(args) } => run_archive_inspect(&args),
        Command::Archive { command: ArchiveCommand::Import(args) } => {
            let mut store = SqliteStore::open(&cli.db)?.with_owner_email(cli.owner_email);
            run_archive_import(&args, &mut store)
        }
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(store),
        DbCommand::Migrate => run_db_migrate(store),
        DbCommand::IntegrityCheck => run_db_integrity_check(store),
    }
}

fn run_db_schema_version(store: &SqliteStore) -> Result<()> {
    let status = store.schema_status()?;
    print_payload(json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty()
    }))
}

fn run_db_migrate(store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    store.migrate()?;
    let after = store.schema_status()?;
    print_payload(json!({
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_db_integrity_check(store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    let report = store.integrity_check()?;
    let counts = store.counts()?;
    print_payload(json!({
        "status": if report.quick_check_ok && report.foreign_key_violations.is_empty() { "ok" } else { "failed" },
        "integrity": report,
        "counts": counts
    }))
}

fn run_archive_inspect(args: &ArchiveInspectArgs) -> Result<()> {
    let archive = open_archive(&args.input)?;
    let version_error = archive.check_version().err();

    let mut entities = Map::new();
    for name in archive.entity_names() {
        let count = archive.entity_count(&name);
        entities.insert(name, json!(count));
    }
    let groups_with_members =
        archive.iter_group_uuids().filter(|group| !group.node_uuids.is_empty()).count();

    print_payload(json!({
        "archive": args.input,
        "export_version": archive.metadata().export_version,
        "supported": version_error.is_none(),
        "version_error": version_error.map(|err| err.to_string()),
        "entities": entities,
        "links": archive.link_count(),
        "groups_with_members": groups_with_members
    }))
}

fn run_archive_import(args: &ArchiveImportArgs, store: &mut SqliteStore) -> Result<()> {
    let options = args.options();
    options.validate()?;
    store.migrate()?;

    let repository = FsRepository::new(&args.repository);
    let mut resolver = PromptResolver;
    let report = import_archive(&args.input, store, &repository, &options, &mut resolver)?;
    info!(archive = %args.input.display(), "archive imported");

    print_payload(import_summary(&args.input, &report))
}

fn open_archive(path: &Path) -> Result<JsonArchive> {
    JsonArchive::open(path)
        .map_err(anyhow::Error::from)
        .with_context(|| format!("failed to open archive {}", path.display()))
}

fn import_summary(path: &Path, report: &ImportReport) -> Value {
    let mut entities = Map::new();
    for kind in EntityKind::ALL {
        entities.insert(
            kind.as_str().to_string(),
            json!({
                "new": report.result.new_count(kind),
                "existing": report.result.existing_count(kind)
            }),
        );
    }
    json!({
        "status": "ok",
        "archive": path,
        "entities": entities,
        "links": report.result.links.len(),
        "group_label": report.group_label
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_names_the_import_error_kind() {
        let err = anyhow::Error::from(ImportError::DanglingLink("missing node".to_string()));
        let envelope = error_envelope(&err);
        assert_eq!(envelope["status"], "error");
        assert_eq!(envelope["error"]["kind"], "dangling_link");
        assert_eq!(envelope["error"]["message"], "dangling link: missing node");
    }

    #[test]
    fn context_does_not_hide_the_error_kind() {
        let err = anyhow::Error::from(ImportError::CorruptArchive("bad json".to_string()))
            .context("failed to open archive /tmp/x");
        assert_eq!(error_envelope(&err)["error"]["kind"], "corrupt_archive");
    }

    #[test]
    fn non_object_payloads_are_wrapped() {
        let wrapped = stamp_contract(json!([1, 2]));
        assert_eq!(wrapped["contract_version"], CLI_CONTRACT_VERSION);
        assert_eq!(wrapped["payload"], json!([1, 2]));

        let stamped = stamp_contract(json!({"status": "ok"}));
        assert_eq!(stamped, json!({"status": "ok", "contract_version": CLI_CONTRACT_VERSION}));
    }

    struct BrokenTerminal;

    impl Write for BrokenTerminal {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "terminal closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "terminal closed"))
        }
    }

    fn ask(answers: &str, prompt: &mut dyn Write) -> Result<ConflictChoice, ImportError> {
        ask_choice("tag", &json!("old"), &json!("new"), &mut answers.as_bytes(), prompt)
    }

    #[test]
    fn prompt_repeats_until_a_known_answer() {
        let mut shown = Vec::new();
        assert_eq!(ask("maybe\ni\n", &mut shown), Ok(ConflictChoice::UseImported));
        let shown = String::from_utf8_lossy(&shown);
        assert_eq!(shown.matches("extra `tag` differs").count(), 2);
        assert!(shown.contains("please answer e, i or d"));

        assert_eq!(ask("d\n", &mut Vec::new()), Ok(ConflictChoice::Drop));
        assert_eq!(ask("", &mut Vec::new()), Ok(ConflictChoice::KeepExisting));
    }

    #[test]
    fn unwritable_prompt_aborts_instead_of_keeping_the_value() {
        let result = ask("i\n", &mut BrokenTerminal);
        assert!(
            matches!(&result, Err(ImportError::ArchiveImport(message)) if message.contains("terminal closed")),
            "{result:?}"
        );
    }

    #[test]
    fn import_flags_map_onto_options() {
        let cli = Cli::parse_from([
            "parc",
            "archive",
            "import",
            "--in",
            "archive",
            "--group",
            "batch",
            "--extras-mode-existing",
            "ncu",
            "--comment-mode",
            "overwrite",
            "--batch-size",
            "7",
        ]);
        let Command::Archive { command: ArchiveCommand::Import(args) } = cli.command else {
            panic!("expected archive import");
        };
        let options = args.options();
        assert_eq!(options.target_group.as_deref(), Some("batch"));
        assert_eq!(options.extras_mode_existing.to_string(), "ncu");
        assert_eq!(options.comment_mode, CommentMode::Overwrite);
        assert_eq!(options.extras_mode_new, NewExtrasMode::Import);
        assert_eq!(options.batch_size, 7);
        assert!(!options.ignore_unknown_nodes);
    }
}
