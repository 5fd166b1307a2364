use crate::archive;
use crate::injection::{apply_injections, default_injections, Injection};
use crate::templates;
use paygate_common::{DeployError, ResourceConfig, SourceFiles};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tracing::{info, warn};

/// Token replaced by the creator's payout address in every source file
pub const WALLET_PLACEHOLDER: &str = "__CREATOR_WALLET__";

pub const DEFAULT_MAX_CONTEXT_BYTES: usize = 5 * 1024 * 1024;

/// Entry points, most specific first
const MAIN_FILE_CANDIDATES: &[&str] = &[
    "src/index.ts",
    "src/index.js",
    "src/server.ts",
    "src/server.js",
    "src/app.ts",
    "src/app.js",
    "index.ts",
    "index.js",
    "server.ts",
    "server.js",
];

/// Lowercased basenames of build recipes the assembler always replaces
const RECIPE_FILES: &[&str] = &["dockerfile", "containerfile", ".dockerignore"];

#[derive(Error, Debug)]
pub enum AssembleError {
    #[error("Build context is {size} bytes, limit is {limit} bytes")]
    TooLarge { size: usize, limit: usize },

    #[error("Invalid source file: {0}")]
    Invalid(String),

    #[error("Failed to pack build context: {0}")]
    Archive(#[from] std::io::Error),
}

impl From<AssembleError> for DeployError {
    fn from(err: AssembleError) -> Self {
        match err {
            AssembleError::TooLarge { size, limit } => DeployError::ContextTooLarge { size, limit },
            AssembleError::Invalid(msg) => DeployError::InvalidRequest(msg),
            AssembleError::Archive(e) => DeployError::Engine(format!("Failed to pack build context: {}", e)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AssemblerConfig {
    /// Shared image every resource is built from
    pub base_image: String,
    pub max_context_bytes: usize,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            base_image: "paygate/resource-base:latest".to_string(),
            max_context_bytes: DEFAULT_MAX_CONTEXT_BYTES,
        }
    }
}

/// A build-ready unit
#[derive(Debug, Clone)]
pub struct BuildContext {
    /// Source files after substitution, synthesis and injection
    pub files: BTreeMap<String, String>,
    pub dockerfile: String,
    pub build_args: HashMap<String, String>,
    pub main_file: Option<String>,
    /// Names of the injections inserted into the main file
    pub injected: Vec<&'static str>,
}

impl BuildContext {
    /// Tar stream with the generated `Dockerfile` at the root
    pub fn to_tar(&self) -> Result<Vec<u8>, AssembleError> {
        let mut entries = self.files.clone();
        entries.insert("Dockerfile".to_string(), self.dockerfile.clone());
        Ok(archive::pack(&entries)?)
    }
}

/// Total bytes across all file contents
pub fn context_size(files: &SourceFiles) -> usize {
    files.values().map(String::len).sum()
}

pub struct BuildContextAssembler {
    config: AssemblerConfig,
    injections: Vec<Injection>,
}

impl BuildContextAssembler {
    pub fn new(config: AssemblerConfig) -> Self {
        Self {
            config,
            injections: default_injections(),
        }
    }

    pub fn config(&self) -> &AssemblerConfig {
        &self.config
    }

    /// Reject payloads above the byte limit
    pub fn check_size(&self, files: &SourceFiles) -> Result<(), AssembleError> {
        let size = context_size(files);
        if size > self.config.max_context_bytes {
            return Err(AssembleError::TooLarge {
                size,
                limit: self.config.max_context_bytes,
            });
        }
        Ok(())
    }

    /// Assemble `files` for `resource`. Pure: no engine access, and the
    /// same inputs always give the same output.
    pub fn assemble(
        &self,
        files: &SourceFiles,
        resource: &ResourceConfig,
    ) -> Result<BuildContext, AssembleError> {
        let mut out: BTreeMap<String, String> = BTreeMap::new();

        for (path, content) in files {
            let path = normalize_path(path)?;
            if is_build_recipe(&path) {
                warn!(resource_id = %resource.id, path = %path, "Discarding user-supplied build recipe");
                continue;
            }
            out.insert(path, content.replace(WALLET_PLACEHOLDER, &resource.creator_wallet));
        }

        self.check_size(&out)?;

        let typescript = out.keys().any(|p| p.ends_with(".ts") || p.ends_with(".tsx"));
        if typescript && !out.contains_key("tsconfig.json") {
            out.insert("tsconfig.json".to_string(), templates::default_tsconfig());
        }
        if !out.contains_key("package.json") {
            out.insert(
                "package.json".to_string(),
                templates::default_package_json(&resource.id),
            );
        }

        let main_file = MAIN_FILE_CANDIDATES
            .iter()
            .find(|candidate| out.contains_key(**candidate))
            .map(|candidate| candidate.to_string());

        let mut injected = Vec::new();
        match &main_file {
            Some(main) => {
                if let Some(source) = out.get_mut(main) {
                    let (patched, applied) = apply_injections(source, resource, &self.injections);
                    *source = patched;
                    injected = applied;
                }
            }
            None => {
                warn!(resource_id = %resource.id, "No main file found, skipping injections");
            }
        }

        let port = resource.resource_type.internal_port();
        let dockerfile = match &main_file {
            Some(main) if main.ends_with(".ts") => {
                templates::dockerfile(&self.config.base_image, port, &["tsx", main.as_str()])
            }
            Some(main) => templates::dockerfile(&self.config.base_image, port, &["node", main.as_str()]),
            None => templates::dockerfile(&self.config.base_image, port, &["npm", "start"]),
        };

        let build_args = HashMap::from([
            ("RESOURCE_ID".to_string(), resource.id.clone()),
            ("CREATOR_WALLET".to_string(), resource.creator_wallet.clone()),
            ("PORT".to_string(), port.to_string()),
            ("RESOURCE_TYPE".to_string(), resource.resource_type.to_string()),
        ]);

        info!(
            resource_id = %resource.id,
            files = out.len(),
            bytes = context_size(&out),
            main_file = ?main_file,
            injected = ?injected,
            "Assembled build context"
        );

        Ok(BuildContext {
            files: out,
            dockerfile,
            build_args,
            main_file,
            injected,
        })
    }
}

fn normalize_path(path: &str) -> Result<String, AssembleError> {
    let trimmed = path.trim().trim_start_matches("./");
    if trimmed.is_empty() {
        return Err(AssembleError::Invalid("empty file path".to_string()));
    }
    if trimmed.starts_with('/') || trimmed.contains('\\') {
        return Err(AssembleError::Invalid(format!("path must be relative: {}", path)));
    }
    if trimmed.split('/').any(|part| part == ".." || part.is_empty()) {
        return Err(AssembleError::Invalid(format!("path escapes the build context: {}", path)));
    }
    Ok(trimmed.to_string())
}

fn is_build_recipe(path: &str) -> bool {
    let basename = path.rsplit('/').next().unwrap_or(path).to_ascii_lowercase();
    RECIPE_FILES.contains(&basename.as_str())
}
