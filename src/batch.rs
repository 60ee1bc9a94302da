//! Batch expander: materializes a parameter sweep into sibling project
//! directories, each a fully configured pipeline.

use crate::{
    command::CommandRegistry,
    config::{self, Config, ConfigError, ConfigFormat},
    dispatch::{abbrev, value_fragment},
    pipeline::{Pipeline, PipelineError},
    status::STATE_DIR,
};
use serde_json::Value;
use std::{
    collections::BTreeSet,
    fs,
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info, warn};
use tracing_unwrap::ResultExt;

/// Index of generated subdirectories, written alongside the batch config.
pub const BATCH_CSV: &str = "batch_jobs.csv";

const TOO_MANY_JOBS_WARNING_THRESH: usize = 1_000;

#[derive(Error, Debug)]
pub enum BatchError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Pipeline(#[from] Box<PipelineError>),
    #[error("Batch config needs the {0:?} key")]
    MissingKey(&'static str),
    #[error("Batch config key \"sets\" must be a list of mappings")]
    SetsNotAList,
    #[error("Invalid batch set: {0}")]
    BadSet(String),
    #[error("Found multiple sets with the same set_tag: {0:?}")]
    DuplicateSetTag(String),
    #[error("Batch arguments must be lists, but {key:?} in set {set_tag:?} is not")]
    ArgsNotLists { set_tag: String, key: String },
    #[error("Arguments in set {set_tag:?} must share a length, got {lengths:?}")]
    ZipLengthMismatch {
        set_tag: String,
        lengths: Vec<usize>,
    },
    #[error("Could not find file to modify in batch jobs: {0}")]
    FileMissing(PathBuf),
    #[error("Could not find the pipeline config file: {0}")]
    PipelineConfigMissing(PathBuf),
    #[error("Batch file operation failed on {0}")]
    Io(PathBuf, #[source] io::Error),
    #[error("Failed to read or write the batch index csv")]
    Csv(#[from] csv::Error),
    #[error("Cannot delete batch jobs without the index csv: {0}")]
    IndexMissing(PathBuf),
    #[error("Batch index csv is missing the \"job\" column")]
    BadIndex,
}

/// One generated subdirectory: its name, the scalar argument tuple that
/// produced it, and the files those values substitute into.
#[derive(Debug, Clone)]
struct BatchJob {
    name: String,
    set_tag: String,
    values: Vec<(String, Value)>,
    files: Vec<PathBuf>,
}

pub struct BatchExpander<'a> {
    registry: &'a CommandRegistry,
    base_dir: PathBuf,
    pipeline_config: PathBuf,
    jobs: Vec<BatchJob>,
    verbose: bool,
}

impl<'a> BatchExpander<'a> {
    /// Load and validate a batch config, either a mapping config or a
    /// tabular csv with one row per generated subdirectory.
    pub fn new(
        registry: &'a CommandRegistry,
        config_path: &Path,
        verbose: bool,
    ) -> Result<Self, BatchError> {
        let config_path = config_path
            .canonicalize()
            .map_err(|error| BatchError::Io(config_path.to_path_buf(), error))?;
        let base_dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let is_csv = config_path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
        let (pipeline_config, sets) = if is_csv {
            parse_batch_table(&config_path)?
        } else {
            parse_batch_mapping(&config::load_config_opts(&config_path, false)?)?
        };

        let pipeline_config = resolve_file(&pipeline_config, &base_dir);
        if !pipeline_config.is_file() {
            return Err(BatchError::PipelineConfigMissing(pipeline_config));
        }

        let jobs = expand_sets(sets, &base_dir)?;
        info!("Batch job initialized with {} sub jobs", jobs.len());
        if jobs.len() > TOO_MANY_JOBS_WARNING_THRESH {
            warn!(
                "Large number of batch jobs found: {}! Proceeding, but consider double \
                 checking your config",
                jobs.len()
            );
        }

        Ok(Self {
            registry,
            base_dir,
            pipeline_config,
            jobs,
            verbose,
        })
    }

    /// Generated subdirectory paths, in declared order.
    pub fn sub_dirs(&self) -> Vec<PathBuf> {
        self.jobs.iter().map(|job| self.base_dir.join(&job.name)).collect()
    }

    /// Create all job subdirectories: copy the source tree verbatim,
    /// substitute swept values into the listed files, and record the index.
    pub fn make_job_dirs(&self) -> Result<(), BatchError> {
        self.write_index()?;
        info!("Preparing batch job directories...");

        let job_names: BTreeSet<&str> = self.jobs.iter().map(|job| job.name.as_str()).collect();
        let source_files = collect_source_files(&self.base_dir, &job_names)?;

        for job in &self.jobs {
            let job_dir = self.base_dir.join(&job.name);
            debug!(job = %job.name, "Creating batch job directory");

            for source in &source_files {
                // walked files always live under the base dir
                let relative = source.strip_prefix(&self.base_dir).unwrap_or_log();
                let target = job_dir.join(relative);
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)
                        .map_err(|error| BatchError::Io(parent.to_path_buf(), error))?;
                }

                if job.files.iter().any(|modified| modified == source) {
                    substitute_file(source, &target, &job.values)?;
                } else {
                    fs::copy(source, &target)
                        .map_err(|error| BatchError::Io(target.clone(), error))?;
                }
            }
        }

        info!("Batch job directories ready for execution");
        Ok(())
    }

    fn write_index(&self) -> Result<(), BatchError> {
        let mut arg_columns: Vec<String> = Vec::new();
        for job in &self.jobs {
            for (key, _) in &job.values {
                if !arg_columns.iter().any(|column| column == key) {
                    arg_columns.push(key.clone());
                }
            }
        }

        let index_path = self.base_dir.join(BATCH_CSV);
        let mut writer = csv::Writer::from_path(&index_path)?;

        let mut header = vec!["job".to_owned()];
        header.extend(arg_columns.iter().cloned());
        header.extend(["set_tag".to_owned(), "files".to_owned(), "pipeline_config".to_owned()]);
        writer.write_record(&header)?;

        for job in &self.jobs {
            let mut record = vec![job.name.clone()];
            for column in &arg_columns {
                let value = job
                    .values
                    .iter()
                    .find(|(key, _)| key == column)
                    .map(|(_, value)| render_cell(value))
                    .unwrap_or_default();
                record.push(value);
            }
            record.push(job.set_tag.clone());
            record.push(
                serde_json::to_string(
                    &job.files
                        .iter()
                        .map(|file| file.to_string_lossy().into_owned())
                        .collect::<Vec<_>>(),
                )
                .map_err(ConfigError::Json)?,
            );
            record.push(self.pipeline_config.to_string_lossy().into_owned());
            writer.write_record(&record)?;
        }

        writer.flush().map_err(|error| BatchError::Io(index_path, error))?;
        Ok(())
    }

    /// Run the batch: materialize directories, then drive each pipeline
    /// unless this is a dry run.
    pub fn run(&self, dry_run: bool, monitor_background: bool) -> Result<(), BatchError> {
        self.make_job_dirs()?;
        if dry_run {
            info!("Dry run requested; no pipelines were executed");
            return Ok(());
        }

        let pipeline_name = self
            .pipeline_config
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("config_pipeline.json"));

        for sub_dir in self.sub_dirs() {
            let pipeline_config = sub_dir.join(&pipeline_name);
            if !pipeline_config.is_file() {
                return Err(BatchError::PipelineConfigMissing(pipeline_config));
            }

            if monitor_background {
                Pipeline::kickoff_background(&pipeline_config).map_err(Box::new)?;
            } else {
                Pipeline::new(self.registry, &pipeline_config, self.verbose)
                    .map_err(Box::new)?
                    .one_shot()
                    .map_err(Box::new)?;
            }
        }

        Ok(())
    }

    /// Best-effort cancellation across all batch sub-pipelines.
    pub fn cancel(&self) -> Result<(), BatchError> {
        let pipeline_name = self
            .pipeline_config
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_default();

        for sub_dir in self.sub_dirs() {
            let pipeline_config = sub_dir.join(&pipeline_name);
            if pipeline_config.is_file() {
                Pipeline::new(self.registry, &pipeline_config, self.verbose)
                    .map_err(Box::new)?
                    .cancel_all()
                    .map_err(Box::new)?;
            }
        }

        Ok(())
    }

    /// Remove the index csv and every subdirectory it names. Only
    /// directories recorded in the index are touched.
    pub fn delete(&self) -> Result<(), BatchError> {
        let index_path = self.base_dir.join(BATCH_CSV);
        if !index_path.is_file() {
            return Err(BatchError::IndexMissing(index_path));
        }

        let mut reader = csv::Reader::from_path(&index_path)?;
        let job_column = reader
            .headers()?
            .iter()
            .position(|column| column == "job")
            .ok_or(BatchError::BadIndex)?;

        for record in reader.records() {
            let record = record?;
            let Some(job_name) = record.get(job_column) else {
                continue;
            };
            let job_dir = self.base_dir.join(job_name);
            if job_dir.is_dir() {
                info!(job = %job_name, "Removing batch job directory");
                fs::remove_dir_all(&job_dir).map_err(|error| BatchError::Io(job_dir, error))?;
            } else {
                warn!(job = %job_name, "Cannot find batch job directory");
            }
        }

        fs::remove_file(&index_path).map_err(|error| BatchError::Io(index_path, error))?;
        Ok(())
    }
}

/// Parsed but not yet expanded batch set.
#[derive(Debug, Clone)]
struct BatchSet {
    set_tag: String,
    args: Vec<(String, Vec<Value>)>,
    files: Vec<String>,
}

fn parse_batch_mapping(config: &Config) -> Result<(PathBuf, Vec<BatchSet>), BatchError> {
    let pipeline_config = config
        .get("pipeline_config")
        .and_then(Value::as_str)
        .ok_or(BatchError::MissingKey("pipeline_config"))?;

    let sets_value = config.get("sets").ok_or(BatchError::MissingKey("sets"))?;
    let entries = sets_value.as_array().ok_or(BatchError::SetsNotAList)?;

    let mut sets = Vec::with_capacity(entries.len());
    for entry in entries {
        let mapping = entry
            .as_object()
            .ok_or_else(|| BatchError::BadSet("batch sets must be mappings".into()))?;

        let set_tag = mapping
            .get("set_tag")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let args_value = mapping
            .get("args")
            .and_then(Value::as_object)
            .ok_or_else(|| BatchError::BadSet(format!("set {set_tag:?} needs an \"args\" mapping")))?;
        let files_value = mapping
            .get("files")
            .and_then(Value::as_array)
            .ok_or_else(|| BatchError::BadSet(format!("set {set_tag:?} needs a \"files\" list")))?;

        let mut args = Vec::with_capacity(args_value.len());
        for (key, value) in args_value {
            let list = value.as_array().ok_or_else(|| BatchError::ArgsNotLists {
                set_tag: set_tag.clone(),
                key: key.clone(),
            })?;
            args.push((key.clone(), list.clone()));
        }

        let files = files_value
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_owned)
            .collect();

        sets.push(BatchSet {
            set_tag,
            args,
            files,
        });
    }

    Ok((PathBuf::from(pipeline_config), sets))
}

/// Tabular batch config: reserved columns `set_tag`, `files`, and
/// `pipeline_config`; every other column is a swept parameter. Each row
/// becomes one generated subdirectory.
fn parse_batch_table(path: &Path) -> Result<(PathBuf, Vec<BatchSet>), BatchError> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers: Vec<String> = reader.headers()?.iter().map(str::to_owned).collect();

    for required in ["set_tag", "files", "pipeline_config"] {
        if !headers.iter().any(|header| header == required) {
            return Err(BatchError::MissingKey(match required {
                "set_tag" => "set_tag",
                "files" => "files",
                _ => "pipeline_config",
            }));
        }
    }

    let mut pipeline_config = None;
    let mut sets = Vec::new();
    for record in reader.records() {
        let record = record?;
        let cell = |column: &str| -> Option<&str> {
            headers
                .iter()
                .position(|header| header == column)
                .and_then(|index| record.get(index))
        };

        let set_tag = cell("set_tag").unwrap_or_default().to_owned();
        let files: Vec<String> = parse_json_cell(cell("files").unwrap_or("[]"))
            .as_array()
            .map(|files| {
                files
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        if pipeline_config.is_none() {
            pipeline_config = cell("pipeline_config").map(PathBuf::from);
        }

        let mut args = Vec::new();
        for (index, header) in headers.iter().enumerate() {
            if matches!(header.as_str(), "set_tag" | "files" | "pipeline_config") {
                continue;
            }
            if let Some(raw) = record.get(index) {
                args.push((header.clone(), vec![parse_json_cell(raw)]));
            }
        }

        sets.push(BatchSet {
            set_tag,
            args,
            files,
        });
    }

    let pipeline_config = pipeline_config.ok_or(BatchError::MissingKey("pipeline_config"))?;
    Ok((pipeline_config, sets))
}

/// Render a swept value for the index csv; strings go bare, everything
/// else as its json literal.
fn render_cell(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Cells may hold bare strings or json-ish literals with single quotes.
fn parse_json_cell(raw: &str) -> Value {
    let cleaned = raw.trim().replace('\'', "\"");
    serde_json::from_str(&cleaned).unwrap_or_else(|_| Value::String(raw.trim().to_owned()))
}

/// Zip each set's argument lists; every tuple yields one subdirectory. The
/// union across sets is disjoint, never a product.
fn expand_sets(sets: Vec<BatchSet>, base_dir: &Path) -> Result<Vec<BatchJob>, BatchError> {
    let mut seen_tags = BTreeSet::new();
    let mut jobs = Vec::new();

    for set in sets {
        if !seen_tags.insert(set.set_tag.clone()) {
            return Err(BatchError::DuplicateSetTag(set.set_tag));
        }

        let lengths: Vec<usize> = set.args.iter().map(|(_, list)| list.len()).collect();
        if lengths.windows(2).any(|pair| pair[0] != pair[1]) {
            return Err(BatchError::ZipLengthMismatch {
                set_tag: set.set_tag,
                lengths,
            });
        }
        let count = lengths.first().copied().unwrap_or(0);

        let files: Vec<PathBuf> = set
            .files
            .iter()
            .map(|file| resolve_file(Path::new(file), base_dir))
            .collect();
        for file in &files {
            if !file.is_file() {
                return Err(BatchError::FileMissing(file.clone()));
            }
        }

        info!(
            set_tag = %set.set_tag,
            jobs = count,
            "Found batch projects in set. Creating jobs..."
        );

        for index in 0..count {
            let values: Vec<(String, Value)> = set
                .args
                .iter()
                .map(|(key, list)| (key.clone(), list[index].clone()))
                .collect();
            let name = job_name(&set.set_tag, &set.args, &values);
            jobs.push(BatchJob {
                name,
                set_tag: set.set_tag.clone(),
                values,
                files: files.clone(),
            });
        }
    }

    Ok(jobs)
}

/// Subdirectory name: the set tag plus a fragment per argument that
/// actually varies within the set, in declared order.
fn job_name(set_tag: &str, args: &[(String, Vec<Value>)], values: &[(String, Value)]) -> String {
    let mut name = set_tag.to_owned();
    for (key, value) in values {
        let varies = args
            .iter()
            .find(|(arg_key, _)| arg_key == key)
            .is_some_and(|(_, list)| list.len() > 1);
        if varies {
            name.push_str(&format!("_{}{}", abbrev(key), value_fragment(value)));
        }
    }
    name.trim_matches('_').to_owned()
}

fn resolve_file(path: &Path, base_dir: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        // drop a leading ./ so the result compares equal to walked paths
        let relative = path.strip_prefix(".").unwrap_or(path);
        base_dir.join(relative)
    }
}

/// Every file under the base dir that belongs in a job copy: the index
/// csv, prior job directories, and the status state dir are skipped.
fn collect_source_files(
    base_dir: &Path,
    job_names: &BTreeSet<&str>,
) -> Result<Vec<PathBuf>, BatchError> {
    let mut files = Vec::new();
    collect_into(base_dir, base_dir, job_names, &mut files)?;
    files.sort();
    Ok(files)
}

fn collect_into(
    dir: &Path,
    base_dir: &Path,
    job_names: &BTreeSet<&str>,
    files: &mut Vec<PathBuf>,
) -> Result<(), BatchError> {
    let entries = fs::read_dir(dir).map_err(|error| BatchError::Io(dir.to_path_buf(), error))?;
    for entry in entries.filter_map(|entry| entry.ok()) {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };

        if path.is_dir() {
            if name == STATE_DIR || (dir == base_dir && job_names.contains(name)) {
                continue;
            }
            collect_into(&path, base_dir, job_names, files)?;
        } else if name != BATCH_CSV {
            files.push(path);
        }
    }
    Ok(())
}

/// Parse a config file, substitute the swept values for matching keys
/// anywhere in the tree, and write the result to the job copy.
fn substitute_file(
    source: &Path,
    target: &Path,
    values: &[(String, Value)],
) -> Result<(), BatchError> {
    debug!(
        source = %source.display(),
        target = %target.display(),
        "Copying and modifying run file"
    );

    let format = ConfigFormat::from_path(source)?;
    let text =
        fs::read_to_string(source).map_err(|error| BatchError::Io(source.to_path_buf(), error))?;
    let mut value = format.parse(&text)?;
    substitute_values(&mut value, values);

    let rendered = ConfigFormat::from_path(target)?.render(&value)?;
    fs::write(target, rendered).map_err(|error| BatchError::Io(target.to_path_buf(), error))
}

fn substitute_values(value: &mut Value, values: &[(String, Value)]) {
    match value {
        Value::Object(mapping) => {
            for (key, entry) in mapping.iter_mut() {
                if let Some((_, replacement)) = values.iter().find(|(mod_key, _)| mod_key == key) {
                    *entry = replacement.clone();
                } else {
                    substitute_values(entry, values);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                substitute_values(item, values);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn set(set_tag: &str, args: &[(&str, Value)]) -> BatchSet {
        BatchSet {
            set_tag: set_tag.to_owned(),
            args: args
                .iter()
                .map(|(key, list)| ((*key).to_owned(), list.as_array().unwrap().clone()))
                .collect(),
            files: Vec::new(),
        }
    }

    #[test]
    fn sets_zip_and_union() {
        let dir = tempfile::tempdir().unwrap();
        let jobs = expand_sets(
            vec![
                set("s1", &[("a", json!([1, 2])), ("b", json!([3, 4]))]),
                set("s2", &[("a", json!([9, 10]))]),
            ],
            dir.path(),
        )
        .unwrap();

        let names: Vec<&str> = jobs.iter().map(|job| job.name.as_str()).collect();
        assert_eq!(names, vec!["s1_a1_b3", "s1_a2_b4", "s2_a9", "s2_a10"]);
        assert_eq!(jobs[1].values, vec![("a".to_owned(), json!(2)), ("b".to_owned(), json!(4))]);
    }

    #[test]
    fn single_value_args_stay_out_of_the_name() {
        let dir = tempfile::tempdir().unwrap();
        let jobs = expand_sets(
            vec![set(
                "study",
                &[("a", json!([1, 2])), ("resolution", json!([90, 90]))],
            )],
            dir.path(),
        )
        .unwrap();
        assert_eq!(jobs[0].name, "study_a1_rsltn90");

        let jobs = expand_sets(
            vec![set("study", &[("resolution", json!([90]))])],
            dir.path(),
        )
        .unwrap();
        assert_eq!(jobs[0].name, "study");
    }

    #[test]
    fn zip_length_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = expand_sets(
            vec![set("s1", &[("a", json!([1, 2])), ("b", json!([3]))])],
            dir.path(),
        )
        .unwrap_err();
        assert!(matches!(err, BatchError::ZipLengthMismatch { .. }));
    }

    #[test]
    fn duplicate_set_tags_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = expand_sets(
            vec![set("s1", &[("a", json!([1]))]), set("s1", &[("a", json!([2]))])],
            dir.path(),
        )
        .unwrap_err();
        assert!(matches!(err, BatchError::DuplicateSetTag(_)));
    }

    #[test]
    fn substitution_is_recursive() {
        let mut config = json!({
            "execution_control": {"nodes": 1},
            "inputs": {"turbine_height": 80},
            "years": [2007]
        });
        substitute_values(
            &mut config,
            &[
                ("turbine_height".to_owned(), json!(120)),
                ("years".to_owned(), json!([2008, 2009])),
            ],
        );

        assert_eq!(config["inputs"]["turbine_height"], json!(120));
        assert_eq!(config["years"], json!([2008, 2009]));
        assert_eq!(config["execution_control"]["nodes"], json!(1));
    }

    #[test]
    fn json_cells_parse_literals_and_fall_back_to_strings() {
        assert_eq!(parse_json_cell("42"), json!(42));
        assert_eq!(parse_json_cell("[1, 2]"), json!([1, 2]));
        assert_eq!(
            parse_json_cell("['a.json', 'b.json']"),
            json!(["a.json", "b.json"])
        );
        assert_eq!(parse_json_cell("plain"), json!("plain"));
    }

    #[test]
    fn tabular_config_rows_become_sets() {
        let dir = tempfile::tempdir().unwrap();
        let csv_path = dir.path().join("config_batch.csv");
        fs::write(
            &csv_path,
            "set_tag,height,pipeline_config,files\n\
             s1,80,./config_pipeline.json,\"['./config_run.json']\"\n\
             s2,120,./config_pipeline.json,\"['./config_run.json']\"\n",
        )
        .unwrap();

        let (pipeline_config, sets) = parse_batch_table(&csv_path).unwrap();
        assert_eq!(pipeline_config, PathBuf::from("./config_pipeline.json"));
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[0].set_tag, "s1");
        assert_eq!(sets[0].args, vec![("height".to_owned(), vec![json!(80)])]);
        assert_eq!(sets[1].files, vec!["./config_run.json".to_owned()]);

        let jobs = expand_sets(sets, dir.path()).err();
        // the referenced config file does not exist in the temp dir
        assert!(matches!(jobs, Some(BatchError::FileMissing(_))));
    }
}
