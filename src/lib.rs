//! A content-addressed build engine.
//!
//! A [`Derivation`] describes how to produce an artifact: a builder
//! program, its arguments and environment, input derivations, and
//! optional source material. The engine computes a stable fingerprint
//! for the description (the derivation-modulo hash), derives the store
//! paths it will occupy, writes the resolved recipe as a `.drv` file,
//! and can then run the builder in a sandbox and install the result
//! atomically into the store.
//!
//! ```no_run
//! # async fn demo() -> cask::Result<()> {
//! use cask::{instantiate, realize, Derivation, RealizeConfig, Sandbox, Store};
//!
//! let store = Store::open("/cask/store").await?;
//! let drv = Derivation::builder("hello", "/bin/sh")
//!     .arg("-c")
//!     .arg("echo hello > $out/greeting")
//!     .build();
//! let instantiated = instantiate(&store, &drv).await?;
//! let config = RealizeConfig {
//!     sandbox: Sandbox::None,
//!     ..RealizeConfig::default()
//! };
//! let out = realize(&store, &instantiated.drv_path, &config).await?;
//! # let _ = out;
//! # Ok(())
//! # }
//! ```

pub mod base32;
pub mod canon;
pub mod derivation;
pub mod error;
pub mod hash;
pub mod instantiate;
pub mod modulo;
pub mod realize;
pub mod store;
pub mod store_path;

pub use derivation::{Derivation, DerivationBuilder, DrvFile, DrvOutput, OutputHash, Source};
pub use error::{Error, Result};
pub use instantiate::{instantiate, Instantiated};
pub use modulo::{all_deps, hash_derivation_modulo, topo_sort, CycleError};
pub use realize::{realize, RealizeConfig, Sandbox};
pub use store::Store;
pub use store_path::{HashMode, StoreDir, StorePath};
