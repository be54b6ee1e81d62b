//! Task persistence: save a descriptor into a run directory and load it back.
//!
//! Run directory layout:
//!
//! ```text
//! <run dir>/
//!   taskfile.json      task marker (discovery matches this name)
//!   runscript          verbatim generator text
//!   settings.json      written by the settings' own serializer
//!   run.log            supervisor log
//!   runfiles/<name>.dat
//! ```

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use jsonschema::{Validator, validator_for};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, instrument, warn};

use crate::error::PersistError;
use crate::io::outdir::dir_name_for_identifier;
use crate::settings::{SETTINGS_FILE_NAME, SettingsRegistry};
use crate::task::{Runfile, TaskDescriptor, validate_leaf_name};

/// Fixed name of the task marker file.
pub const TASK_FILE_NAME: &str = "taskfile.json";
/// Generator text, doubling as the re-executable entry point.
pub const GENERATOR_FILE_NAME: &str = "runscript";
pub const RUNFILES_DIR_NAME: &str = "runfiles";

const FORMAT_VERSION: u32 = 1;
const TASKFILE_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/taskfile.v1.schema.json"
));

/// Compiled once; an unusable embedded schema is reported on every load.
static TASKFILE_VALIDATOR: LazyLock<Result<Validator, String>> = LazyLock::new(|| {
    let schema: Value = serde_json::from_str(TASKFILE_SCHEMA).map_err(|err| err.to_string())?;
    validator_for(&schema).map_err(|err| err.to_string())
});

/// On-disk form of a [`TaskDescriptor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub format_version: u32,
    pub owner: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub generator: Option<String>,
    #[serde(default)]
    pub runfiles: Vec<Runfile>,
    #[serde(default)]
    pub task_name: Option<String>,
    #[serde(default)]
    pub num_repeats: u32,
    #[serde(default)]
    pub exit_on_complete: bool,
    #[serde(default)]
    pub output_directory: Option<PathBuf>,
    #[serde(default)]
    pub already_run: bool,
    pub settings: SettingsRecord,
}

/// Settings tagged with their kind so the registry can rebuild them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsRecord {
    pub kind: String,
    pub value: Value,
}

/// Convert a descriptor to its on-disk record.
///
/// Fails with [`PersistError::UnknownSettingsType`] if the settings kind is not
/// registered, before anything is written.
pub fn encode_task(
    task: &TaskDescriptor,
    registry: &SettingsRegistry,
) -> Result<TaskRecord, PersistError> {
    let kind = task.settings.kind();
    if !registry.contains(kind) {
        return Err(PersistError::UnknownSettingsType(kind.to_string()));
    }
    let value = task
        .settings
        .to_value()
        .map_err(|err| PersistError::Serialize(format!("{err:#}")))?;
    Ok(TaskRecord {
        format_version: FORMAT_VERSION,
        owner: task.owner.clone(),
        description: task.description.clone(),
        generator: task.generator.clone(),
        runfiles: task.runfiles.clone(),
        task_name: task.task_name.clone(),
        num_repeats: task.num_repeats,
        exit_on_complete: task.exit_on_complete,
        output_directory: task.output_directory.clone(),
        already_run: task.already_run,
        settings: SettingsRecord {
            kind: kind.to_string(),
            value,
        },
    })
}

/// Serialize a descriptor to pretty JSON bytes (task file and dispatch payload).
pub fn task_to_bytes(
    task: &TaskDescriptor,
    registry: &SettingsRegistry,
) -> Result<Vec<u8>, PersistError> {
    let record = encode_task(task, registry)?;
    let mut buf = serde_json::to_string_pretty(&record)
        .map_err(|err| PersistError::Serialize(err.to_string()))?;
    buf.push('\n');
    Ok(buf.into_bytes())
}

/// Persist `task` into `directory`: runfiles, settings file, generator, task file.
///
/// The task file is written last and atomically, so a directory without one
/// is never mistaken for a complete record.
#[instrument(skip_all, fields(directory = %directory.display()))]
pub fn save_task(
    task: &TaskDescriptor,
    directory: &Path,
    registry: &SettingsRegistry,
) -> Result<(), PersistError> {
    let payload = task_to_bytes(task, registry)?;

    fs::create_dir_all(directory).map_err(io_error(directory))?;
    write_runfiles(&task.runfiles, directory)?;
    write_settings_file(task, directory)?;
    if let Some(generator) = &task.generator {
        write_generator(generator, &directory.join(GENERATOR_FILE_NAME))?;
    }
    write_atomic(&directory.join(TASK_FILE_NAME), &payload)?;

    debug!(owner = %task.owner, runfiles = task.runfiles.len(), "task saved");
    Ok(())
}

fn write_runfiles(runfiles: &[Runfile], directory: &Path) -> Result<(), PersistError> {
    if runfiles.is_empty() {
        return Ok(());
    }
    let runfiles_dir = directory.join(RUNFILES_DIR_NAME);
    fs::create_dir_all(&runfiles_dir).map_err(io_error(&runfiles_dir))?;
    for runfile in runfiles {
        let path = runfiles_dir.join(runfile.file_name());
        fs::write(&path, &runfile.content).map_err(io_error(&path))?;
        if let Some(param) = &runfile.settings_param {
            warn!(
                runfile = %runfile.name,
                settings_param = %param,
                "runfile settings_param is advisory and is not applied to the settings"
            );
        }
    }
    Ok(())
}

fn write_settings_file(task: &TaskDescriptor, directory: &Path) -> Result<(), PersistError> {
    let path = directory.join(SETTINGS_FILE_NAME);
    let mut buf = Vec::new();
    task.settings
        .save(&mut buf)
        .map_err(|err| PersistError::Serialize(format!("{err:#}")))?;
    fs::write(&path, buf).map_err(io_error(&path))
}

fn write_generator(generator: &str, path: &Path) -> Result<(), PersistError> {
    fs::write(path, generator).map_err(io_error(path))?;
    if generator.starts_with("#!") {
        mark_executable(path)?;
    }
    Ok(())
}

#[cfg(unix)]
fn mark_executable(path: &Path) -> Result<(), PersistError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).map_err(io_error(path))
}

#[cfg(not(unix))]
fn mark_executable(_path: &Path) -> Result<(), PersistError> {
    Ok(())
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), PersistError> {
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents).map_err(io_error(&tmp_path))?;
    fs::rename(&tmp_path, path).map_err(io_error(path))
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> PersistError + '_ {
    move |source| PersistError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Load a task file.
///
/// `output_directory` and `source_path` are rebound to where the file was
/// found, not where it was first written.
pub fn load_task(path: &Path, registry: &SettingsRegistry) -> Result<TaskDescriptor, PersistError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(PersistError::NotFound(path.to_path_buf()));
        }
        Err(err) => return Err(io_error(path)(err)),
    };
    let value: Value = serde_json::from_slice(&bytes).map_err(|err| {
        if err.is_eof() {
            PersistError::UnexpectedEof(path.to_path_buf())
        } else {
            malformed(path, err.to_string())
        }
    })?;
    validate_schema(path, &value)?;
    let record: TaskRecord =
        serde_json::from_value(value).map_err(|err| malformed(path, err.to_string()))?;
    decode_task(record, path, registry)
}

fn decode_task(
    record: TaskRecord,
    path: &Path,
    registry: &SettingsRegistry,
) -> Result<TaskDescriptor, PersistError> {
    let TaskRecord {
        owner,
        description,
        generator,
        runfiles,
        task_name,
        num_repeats,
        exit_on_complete,
        output_directory: _,
        already_run,
        settings,
        ..
    } = record;

    if let Some(name) = &task_name {
        validate_leaf_name("task_name", name).map_err(|err| malformed(path, format!("{err:#}")))?;
    }
    for runfile in &runfiles {
        runfile
            .validate()
            .map_err(|err| malformed(path, format!("{err:#}")))?;
    }
    if !registry.contains(&settings.kind) {
        return Err(PersistError::UnknownSettingsType(settings.kind));
    }
    let settings = registry
        .decode(&settings.kind, settings.value)
        .map_err(|err| malformed(path, format!("{err:#}")))?;

    let run_dir = path.parent().map(Path::to_path_buf);
    Ok(TaskDescriptor {
        owner,
        description,
        generator,
        runfiles,
        settings,
        task_name,
        num_repeats,
        exit_on_complete,
        output_directory: run_dir.clone(),
        output_directory_base: run_dir.as_deref().and_then(Path::parent).map(Path::to_path_buf),
        already_run,
        source_path: Some(path.to_path_buf()),
    })
}

fn validate_schema(path: &Path, value: &Value) -> Result<(), PersistError> {
    let validator = TASKFILE_VALIDATOR
        .as_ref()
        .map_err(|err| malformed(path, format!("invalid embedded schema: {err}")))?;
    if validator.is_valid(value) {
        return Ok(());
    }
    let messages: Vec<String> = validator
        .iter_errors(value)
        .map(|err| err.to_string())
        .collect();
    Err(malformed(path, messages.join("; ")))
}

fn malformed(path: &Path, message: String) -> PersistError {
    PersistError::Malformed {
        path: path.to_path_buf(),
        message,
    }
}

/// Load a task, reporting failures instead of returning them.
pub fn try_load_task(path: &Path, registry: &SettingsRegistry) -> Option<TaskDescriptor> {
    match load_task(path, registry) {
        Ok(task) => Some(task),
        Err(err) if err.is_soft() => {
            warn!("{err}");
            None
        }
        Err(err) => {
            error!("{err}");
            None
        }
    }
}

/// Resolve what a user typed into a task file path.
///
/// Accepts a task file, a run directory, or a run identifier such as
/// `20110516_091754` looked up under `search_base`.
pub fn resolve_task_path(spec: &str, search_base: &Path) -> PathBuf {
    let candidate = PathBuf::from(spec);
    if candidate.is_dir() {
        return candidate.join(TASK_FILE_NAME);
    }
    if candidate.exists() || spec.contains(std::path::MAIN_SEPARATOR) || spec.contains('/') {
        return candidate;
    }
    search_base
        .join(dir_name_for_identifier(spec))
        .join(TASK_FILE_NAME)
}
