//! Compose document loading
//!
//! Each document is parsed into a YAML tree, interpolated, validated and
//! deserialized into the typed model. `extends` and `include` are resolved per
//! document, then documents merge left to right and the result is normalized.

use super::config::{is_external, ComposeConfig, ExternalConfig, IncludeConfig, ServiceConfig};
use super::interpolate::interpolate_document;
use super::merge::{canonicalize_service, Merge};
use super::syntax::{is_file_path, mount_types};
use super::validate::{
    schema_version, upgrade_legacy, validate_document, validate_references, PropertyReport,
    SchemaVersion,
};
use crate::config::{load_environment, parse_env_file};
use crate::error::{Result, StackError};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// Default compose file names, in lookup order
pub const DEFAULT_COMPOSE_FILES: &[&str] = &[
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

/// File name standing for standard input
pub const STDIN_FILE: &str = "-";

/// A single Compose document
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub filename: String,
    pub content: String,
}

/// Everything needed to load a project
#[derive(Debug, Clone, Default)]
pub struct ConfigDetails {
    /// Directory relative paths are resolved against
    pub working_dir: PathBuf,
    /// Documents in merge order
    pub config_files: Vec<ConfigFile>,
    /// Interpolation environment
    pub environment: BTreeMap<String, String>,
}

/// Loader switches
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    pub skip_interpolation: bool,
}

/// A normalized model plus the non-fatal property findings
#[derive(Debug, Clone)]
pub struct LoadedCompose {
    pub config: ComposeConfig,
    pub report: PropertyReport,
}

/// Find a default compose file in a directory
pub fn find_compose_file(dir: &Path) -> Option<PathBuf> {
    DEFAULT_COMPOSE_FILES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.exists())
}

/// Read the named documents (`-` reads `stdin` once) and the environment
pub fn get_config_details<R: Read>(files: &[String], mut stdin: R) -> Result<ConfigDetails> {
    let cwd = std::env::current_dir()?;
    let files: Vec<String> = if files.is_empty() {
        match find_compose_file(&cwd) {
            Some(path) => vec![path.to_string_lossy().into_owned()],
            None => {
                return Err(StackError::Usage(
                    "Please specify a Compose file (with --compose-file)".to_string(),
                ))
            }
        }
    } else {
        files.to_vec()
    };

    let mut config_files = Vec::with_capacity(files.len());
    let mut stdin_used = false;
    for file in &files {
        if file == STDIN_FILE {
            if stdin_used {
                return Err(StackError::Usage(
                    "standard input can only be used once as a Compose file".to_string(),
                ));
            }
            stdin_used = true;
            let mut content = String::new();
            stdin.read_to_string(&mut content)?;
            config_files.push(ConfigFile {
                filename: STDIN_FILE.to_string(),
                content,
            });
            continue;
        }
        let path = absolute_path(&cwd, file);
        let content = std::fs::read_to_string(&path).map_err(|e| {
            StackError::Validation(format!("Failed to read compose file {}: {}", file, e))
        })?;
        config_files.push(ConfigFile {
            filename: path.to_string_lossy().into_owned(),
            content,
        });
    }

    let working_dir = match files.first() {
        Some(first) if first != STDIN_FILE => absolute_path(&cwd, first)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| cwd.clone()),
        _ => cwd,
    };
    let environment = load_environment(&working_dir)?;

    Ok(ConfigDetails {
        working_dir,
        config_files,
        environment,
    })
}

/// Load, merge and normalize the documents of a project
pub fn load(details: &ConfigDetails, options: &LoadOptions) -> Result<LoadedCompose> {
    if details.config_files.is_empty() {
        return Err(StackError::Usage("No Compose file specified".to_string()));
    }

    let loader = Loader {
        working_dir: details.working_dir.clone(),
        environment: details.environment.clone(),
        options: *options,
    };

    let mut report = PropertyReport::default();
    let mut merged: Option<ComposeConfig> = None;
    for file in &details.config_files {
        debug!(file = %file.filename, "Loading compose file");
        let mut include_stack = Vec::new();
        let (config, file_report) =
            loader.load_file(Path::new(&file.filename), &file.content, &mut include_stack)?;
        report.extend(file_report);
        match merged.as_mut() {
            Some(base) => base.merge(config),
            None => merged = Some(config),
        }
    }

    let mut config = merged.unwrap_or_default();
    normalize(&mut config, &details.environment)?;
    validate_references(&config)?;
    Ok(LoadedCompose { config, report })
}

struct Loader {
    working_dir: PathBuf,
    environment: BTreeMap<String, String>,
    options: LoadOptions,
}

impl Loader {
    fn file_dir(&self, file: &Path) -> PathBuf {
        if file.as_os_str() == STDIN_FILE {
            return self.working_dir.clone();
        }
        file.parent()
            .map(|p| absolute_path(&self.working_dir, &p.to_string_lossy()))
            .unwrap_or_else(|| self.working_dir.clone())
    }

    /// Parse, interpolate, validate and deserialize one document
    fn parse(&self, file: &Path, content: &str) -> Result<(ComposeConfig, PropertyReport)> {
        let filename = file.to_string_lossy();
        let value: Value = serde_yaml::from_str(content)
            .map_err(|e| StackError::Yaml(format!("{}: {}", filename, e)))?;
        let mapping = match value {
            Value::Mapping(m) => m,
            Value::Null => serde_yaml::Mapping::new(),
            _ => {
                return Err(StackError::Validation(format!(
                    "{}: top-level object must be a mapping",
                    filename
                )))
            }
        };

        let mapping = match schema_version(&mapping)? {
            SchemaVersion::Legacy => upgrade_legacy(mapping),
            SchemaVersion::Versioned(_) => mapping,
        };

        let mut document = Value::Mapping(mapping);
        if !self.options.skip_interpolation {
            interpolate_document(&mut document, &self.environment)?;
        }

        let report = match &document {
            Value::Mapping(m) => validate_document(m, &filename)?,
            _ => PropertyReport::default(),
        };

        let config: ComposeConfig = serde_yaml::from_value(document)
            .map_err(|e| StackError::Validation(format!("{}: {}", filename, e)))?;
        Ok((config, report))
    }

    fn load_file(
        &self,
        file: &Path,
        content: &str,
        include_stack: &mut Vec<PathBuf>,
    ) -> Result<(ComposeConfig, PropertyReport)> {
        let (mut config, mut report) = self.parse(file, content)?;
        resolve_relative_paths(&mut config, &self.working_dir);
        self.resolve_extends(&mut config, file)?;

        let includes = std::mem::take(&mut config.include);
        include_stack.push(file.to_path_buf());
        for include in &includes {
            let (imported, imported_report) = self.load_include(include, file, include_stack)?;
            report.extend(imported_report);
            import(&mut config, imported)?;
        }
        include_stack.pop();

        Ok((config, report))
    }

    fn load_include(
        &self,
        include: &IncludeConfig,
        file: &Path,
        include_stack: &mut Vec<PathBuf>,
    ) -> Result<(ComposeConfig, PropertyReport)> {
        let base_dir = self.file_dir(file);
        let paths: Vec<PathBuf> = include
            .paths()
            .iter()
            .map(|p| absolute_path(&base_dir, p))
            .collect();
        let Some(first) = paths.first() else {
            return Err(StackError::Validation(format!(
                "{}: include requires a path",
                file.display()
            )));
        };

        let project_dir = match include.project_directory() {
            Some(dir) => absolute_path(&base_dir, dir),
            None => first.parent().map(Path::to_path_buf).unwrap_or(base_dir.clone()),
        };

        let mut environment = self.environment.clone();
        let env_files: Vec<(PathBuf, bool)> = if include.env_files().is_empty() {
            vec![(project_dir.join(".env"), false)]
        } else {
            include
                .env_files()
                .iter()
                .map(|f| (absolute_path(&base_dir, f), true))
                .collect()
        };
        for (path, required) in env_files {
            let content = match std::fs::read_to_string(&path) {
                Ok(c) => c,
                Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(StackError::Validation(format!(
                        "Couldn't read env file {}: {}",
                        path.display(),
                        e
                    )))
                }
            };
            for (key, value) in parse_env_file(&content)? {
                environment.entry(key).or_insert(value);
            }
        }

        let child = Loader {
            working_dir: project_dir,
            environment,
            options: self.options,
        };

        let mut report = PropertyReport::default();
        let mut merged: Option<ComposeConfig> = None;
        for path in &paths {
            if include_stack.contains(path) {
                let chain: Vec<String> = include_stack
                    .iter()
                    .chain(std::iter::once(path))
                    .map(|p| p.display().to_string())
                    .collect();
                return Err(StackError::Validation(format!(
                    "include cycle detected: {}",
                    chain.join(" -> ")
                )));
            }
            debug!(file = %path.display(), "Loading included compose file");
            let content = std::fs::read_to_string(path).map_err(|e| {
                StackError::Validation(format!(
                    "Failed to read included file {}: {}",
                    path.display(),
                    e
                ))
            })?;
            let (config, file_report) = child.load_file(path, &content, include_stack)?;
            report.extend(file_report);
            match merged.as_mut() {
                Some(base) => base.merge(config),
                None => merged = Some(config),
            }
        }
        Ok((merged.unwrap_or_default(), report))
    }

    fn resolve_extends(&self, config: &mut ComposeConfig, file: &Path) -> Result<()> {
        if config.services.values().all(|s| s.extends.is_none()) {
            return Ok(());
        }
        let snapshot = config.services.clone();
        for (name, service) in config.services.iter_mut() {
            if service.extends.is_some() {
                let mut tracker = Vec::new();
                *service = self.resolve_service(file, &snapshot, name, &mut tracker)?;
            }
        }
        Ok(())
    }

    fn resolve_service(
        &self,
        file: &Path,
        services: &BTreeMap<String, ServiceConfig>,
        name: &str,
        tracker: &mut Vec<(PathBuf, String)>,
    ) -> Result<ServiceConfig> {
        let key = (file.to_path_buf(), name.to_string());
        if tracker.contains(&key) {
            let chain: Vec<String> = tracker
                .iter()
                .chain(std::iter::once(&key))
                .map(|(f, s)| format!("{}:{}", f.display(), s))
                .collect();
            return Err(StackError::Validation(format!(
                "circular reference with extends: {}",
                chain.join(" -> ")
            )));
        }

        let mut service = services.get(name).cloned().ok_or_else(|| {
            StackError::Validation(format!(
                "cannot extend service {:?} in {}: service not found",
                name,
                file.display()
            ))
        })?;
        let Some(extends) = service.extends.take() else {
            return Ok(service);
        };

        tracker.push(key);
        let mut base = match extends.file() {
            None => self.resolve_service(file, services, extends.service(), tracker)?,
            Some(other) => {
                let path = absolute_path(&self.file_dir(file), other);
                let content = std::fs::read_to_string(&path).map_err(|e| {
                    StackError::Validation(format!(
                        "Failed to read extended file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                let (mut other_config, _) = self.parse(&path, &content)?;
                let dir = self.file_dir(&path);
                resolve_relative_paths(&mut other_config, &dir);
                self.resolve_service(&path, &other_config.services, extends.service(), tracker)?
            }
        };
        tracker.pop();

        base.merge(service);
        base.extends = None;
        Ok(base)
    }
}

fn import(config: &mut ComposeConfig, imported: ComposeConfig) -> Result<()> {
    import_section("services", &mut config.services, imported.services)?;
    import_section("networks", &mut config.networks, imported.networks)?;
    import_section("volumes", &mut config.volumes, imported.volumes)?;
    import_section("secrets", &mut config.secrets, imported.secrets)?;
    import_section("configs", &mut config.configs, imported.configs)?;
    Ok(())
}

fn import_section<T: PartialEq>(
    section: &str,
    target: &mut BTreeMap<String, T>,
    source: BTreeMap<String, T>,
) -> Result<()> {
    for (name, value) in source {
        match target.get(&name) {
            Some(existing) if *existing != value => {
                return Err(StackError::Validation(format!(
                    "imported resource {}.{} conflicts with an existing definition",
                    section, name
                )))
            }
            Some(_) => {}
            None => {
                target.insert(name, value);
            }
        }
    }
    Ok(())
}

/// Anchor relative host paths of a document to its directory
fn resolve_relative_paths(config: &mut ComposeConfig, base: &Path) {
    for service in config.services.values_mut() {
        for volume in &mut service.volumes {
            if volume.volume_type != mount_types::BIND {
                continue;
            }
            if let Some(source) = volume.source.as_mut() {
                if is_file_path(source) {
                    *source = host_path(base, source);
                }
            }
        }
        for env_file in &mut service.env_file {
            *env_file = host_path(base, env_file);
        }
    }
    for secret in config.secrets.values_mut() {
        if let Some(file) = secret.file.as_mut() {
            *file = host_path(base, file);
        }
    }
    for cfg in config.configs.values_mut() {
        if let Some(file) = cfg.file.as_mut() {
            *file = host_path(base, file);
        }
    }
}

fn host_path(base: &Path, path: &str) -> String {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            let rest = path.trim_start_matches('~').trim_start_matches('/');
            return absolute_path(&home, rest).to_string_lossy().into_owned();
        }
        return path.to_string();
    }
    if is_windows_path(path) {
        return path.to_string();
    }
    absolute_path(base, path).to_string_lossy().into_owned()
}

fn is_windows_path(path: &str) -> bool {
    let bytes = path.as_bytes();
    path.starts_with("\\\\") || (bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':')
}

/// Join `path` onto `base` unless already absolute, then drop `.` and `..`
fn absolute_path(base: &Path, path: &str) -> PathBuf {
    let joined = if Path::new(path).is_absolute() {
        PathBuf::from(path)
    } else {
        base.join(path)
    };
    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Apply implicit defaults to the merged model
fn normalize(config: &mut ComposeConfig, environment: &BTreeMap<String, String>) -> Result<()> {
    let mut uses_default = false;
    for service in config.services.values_mut() {
        if service.networks.is_empty() {
            service.networks.insert("default".to_string(), None);
        }
        uses_default |= service.networks.contains_key("default");

        resolve_environment(service, environment)?;
        canonicalize_service(service);
    }
    if uses_default {
        config.networks.entry("default".to_string()).or_default();
    }

    for (key, network) in config.networks.iter_mut() {
        external_name("network", key, &mut network.name, &mut network.external)?;
    }
    for (key, volume) in config.volumes.iter_mut() {
        external_name("volume", key, &mut volume.name, &mut volume.external)?;
    }
    for (key, secret) in config.secrets.iter_mut() {
        external_name("secret", key, &mut secret.name, &mut secret.external)?;
    }
    for (key, cfg) in config.configs.iter_mut() {
        external_name("config", key, &mut cfg.name, &mut cfg.external)?;
    }
    Ok(())
}

/// Fold `env_file` into `environment` and fill unset values from the environment
fn resolve_environment(
    service: &mut ServiceConfig,
    environment: &BTreeMap<String, String>,
) -> Result<()> {
    for env_file in &service.env_file {
        let content = std::fs::read_to_string(env_file).map_err(|e| {
            StackError::Validation(format!("Couldn't find env file {}: {}", env_file, e))
        })?;
        for (key, value) in parse_env_file(&content)? {
            service.environment.entry(key).or_insert(Some(value));
        }
    }
    for (key, value) in service.environment.iter_mut() {
        if value.is_none() {
            *value = environment.get(key).cloned();
        }
    }
    Ok(())
}

fn external_name(
    kind: &str,
    key: &str,
    name: &mut Option<String>,
    external: &mut Option<ExternalConfig>,
) -> Result<()> {
    if let Some(ExternalConfig::Named { name: external_name }) = external.clone() {
        warn!("{} {}: external.name is deprecated; use name instead", kind, key);
        if let Some(explicit) = name.as_ref() {
            if *explicit != external_name {
                return Err(StackError::Validation(format!(
                    "{} {}: name and external.name conflict; only use name",
                    kind, key
                )));
            }
        }
        *name = Some(external_name);
        *external = Some(ExternalConfig::Bool(true));
    }
    if is_external(external) && name.is_none() {
        *name = Some(key.to_string());
    }
    Ok(())
}
