use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hash;
use crate::store_path::{validate_name, HashMode, StorePathError};

/// Host system tag, `<arch>-<os>`, e.g. `x86_64-linux`.
pub fn host_system() -> String {
    let os = match std::env::consts::OS {
        "macos" => "darwin",
        os => os,
    };
    format!("{}-{}", std::env::consts::ARCH, os)
}

/// Source material for a derivation: either a local file to be copied
/// into the store, or a declared content fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Path(PathBuf),
    Fixed(String),
}

/// Declared output hash of a fixed-output derivation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputHash {
    pub algo: String,
    pub hash: String,
    pub mode: Option<HashMode>,
}

impl OutputHash {
    pub fn mode(&self) -> HashMode {
        self.mode.unwrap_or_default()
    }
}

#[derive(Debug)]
struct Inner {
    name: String,
    builder: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    system: Option<String>,
    inputs: OnceLock<Vec<Derivation>>,
    src: Option<Source>,
    output_hash: Option<OutputHash>,
}

/// A build recipe, immutable once constructed.
///
/// `Derivation` is a shared handle; clones refer to the same node, and
/// the engine memoizes on that identity. Two structurally equal
/// derivations built separately are distinct graph nodes, which is what
/// makes diamond sharing explicit: reuse the handle, not the recipe.
#[derive(Debug, Clone)]
pub struct Derivation {
    inner: Arc<Inner>,
}

impl Derivation {
    pub fn builder<N, B>(name: N, builder: B) -> DerivationBuilder
    where
        N: Into<String>,
        B: Into<String>,
    {
        DerivationBuilder {
            name: name.into(),
            builder: builder.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            system: None,
            inputs: Vec::new(),
            src: None,
            output_hash: None,
        }
    }

    /// Stable identity of this node, used as a memoization key.
    pub fn id(&self) -> DrvId {
        DrvId(Arc::as_ptr(&self.inner) as usize)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn builder_ref(&self) -> &str {
        &self.inner.builder
    }

    pub fn args(&self) -> &[String] {
        &self.inner.args
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.inner.env
    }

    /// Resolved system tag, defaulting to the host's.
    pub fn system(&self) -> String {
        self.inner.system.clone().unwrap_or_else(host_system)
    }

    /// Declared inputs in construction order, duplicates collapsed on
    /// identity. Empty until bound for deferred nodes.
    pub fn inputs(&self) -> impl Iterator<Item = &Derivation> {
        let mut seen = Vec::new();
        self.inner
            .inputs
            .get()
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .filter(move |input| {
                let id = input.id();
                if seen.contains(&id) {
                    false
                } else {
                    seen.push(id);
                    true
                }
            })
    }

    /// Binds the inputs of a node created with
    /// [`DerivationBuilder::build_deferred`]. Inputs bind exactly once;
    /// the node is immutable afterwards.
    pub fn bind_inputs<I>(&self, inputs: I) -> Result<(), ValidationError>
    where
        I: IntoIterator<Item = Derivation>,
    {
        self.inner
            .inputs
            .set(inputs.into_iter().collect())
            .map_err(|_| ValidationError::InputsAlreadyBound(self.inner.name.clone()))
    }

    pub fn src(&self) -> Option<&Source> {
        self.inner.src.as_ref()
    }

    pub fn output_hash(&self) -> Option<&OutputHash> {
        self.inner.output_hash.as_ref()
    }

    pub fn is_fixed_output(&self) -> bool {
        self.inner.output_hash.is_some()
    }

    /// Checks the constraints every derivation must satisfy before it is
    /// hashed or written: a valid name, a builder, and for fixed outputs
    /// a supported hash algorithm.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_name(&self.inner.name)
            .map_err(|source| ValidationError::BadName(self.inner.name.clone(), source))?;
        if self.inner.builder.is_empty() {
            return Err(ValidationError::EmptyBuilder(self.inner.name.clone()));
        }
        if let Some(output_hash) = &self.inner.output_hash {
            if output_hash.algo != "sha256" {
                return Err(ValidationError::UnsupportedHashAlgo(
                    output_hash.algo.clone(),
                ));
            }
            if !hash::is_hex_digest(&output_hash.hash) {
                return Err(ValidationError::BadOutputHash(output_hash.hash.clone()));
            }
        }
        Ok(())
    }
}

/// Unique identity of a [`Derivation`] node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DrvId(usize);

pub struct DerivationBuilder {
    name: String,
    builder: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    system: Option<String>,
    inputs: Vec<Derivation>,
    src: Option<Source>,
    output_hash: Option<OutputHash>,
}

impl DerivationBuilder {
    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn system<S: Into<String>>(mut self, system: S) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn input(mut self, input: &Derivation) -> Self {
        self.inputs.push(input.clone());
        self
    }

    pub fn src_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.src = Some(Source::Path(path.into()));
        self
    }

    pub fn src_fixed<S: Into<String>>(mut self, fingerprint: S) -> Self {
        self.src = Some(Source::Fixed(fingerprint.into()));
        self
    }

    pub fn output_hash<A, H>(mut self, algo: A, hash: H, mode: Option<HashMode>) -> Self
    where
        A: Into<String>,
        H: Into<String>,
    {
        self.output_hash = Some(OutputHash {
            algo: algo.into(),
            hash: hash.into(),
            mode,
        });
        self
    }

    pub fn build(mut self) -> Derivation {
        let inputs = OnceLock::from(std::mem::take(&mut self.inputs));
        self.into_derivation(inputs)
    }

    /// Builds a node whose inputs are bound later through
    /// [`Derivation::bind_inputs`], which is the only way a derivation
    /// graph can come to reference one of its own ancestors. Any inputs
    /// already added to this builder are discarded.
    pub fn build_deferred(self) -> Derivation {
        self.into_derivation(OnceLock::new())
    }

    fn into_derivation(self, inputs: OnceLock<Vec<Derivation>>) -> Derivation {
        Derivation {
            inner: Arc::new(Inner {
                name: self.name,
                builder: self.builder,
                args: self.args,
                env: self.env,
                system: self.system,
                inputs,
                src: self.src,
                output_hash: self.output_hash,
            }),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum ValidationError {
    #[error("invalid derivation name '{0}': {1}")]
    BadName(String, #[source] StorePathError),
    #[error("derivation '{0}' has an empty builder")]
    EmptyBuilder(String),
    #[error("unsupported output hash algorithm '{0}'")]
    UnsupportedHashAlgo(String),
    #[error("declared output hash '{0}' is not a sha256 hex digest")]
    BadOutputHash(String),
    #[error("inputs of derivation '{0}' are already bound")]
    InputsAlreadyBound(String),
}

/// One output record of a stored derivation file.
///
/// Fixed-output derivations carry their declared content hash here so
/// the realizer can recognize them; `hash_algo` uses the `r:` prefix for
/// recursive ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrvOutput {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub hash: Option<String>,
    #[serde(
        rename = "hashAlgo",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub hash_algo: Option<String>,
}

/// The resolved build recipe persisted in the store as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrvFile {
    pub outputs: BTreeMap<String, DrvOutput>,
    #[serde(rename = "inputDrvs")]
    pub input_drvs: BTreeMap<String, Vec<String>>,
    #[serde(rename = "inputSrcs")]
    pub input_srcs: Vec<String>,
    pub system: String,
    pub builder: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl DrvFile {
    /// The single `out` output path.
    pub fn out_path(&self) -> Result<&DrvOutput, DrvFileError> {
        self.outputs.get("out").ok_or(DrvFileError::MissingOut)
    }

    pub fn is_fixed_output(&self) -> bool {
        self.outputs
            .values()
            .any(|output| output.hash.is_some())
    }
}

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum DrvFileError {
    #[error("derivation file has no 'out' output")]
    MissingOut,
}
