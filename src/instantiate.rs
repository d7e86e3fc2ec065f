//! Materializing a derivation graph into `.drv` files.
//!
//! Instantiation walks the graph dependencies-first, so every ancestor's
//! derivation file exists in the store before its consumer is written.
//! Cycle detection and validation run over the whole graph before any
//! I/O; failures past that point surface at the node they concern.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use tracing::debug;

use crate::derivation::{Derivation, DrvFile, DrvId, DrvOutput, Source};
use crate::error::{Error, Result};
use crate::modulo;
use crate::store::Store;
use crate::store_path::StorePath;

/// The two paths produced for one derivation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instantiated {
    pub drv_path: StorePath,
    pub out_path: StorePath,
}

/// Writes the `.drv` file for `drv` and, recursively, for every input,
/// returning the root's paths.
pub async fn instantiate(store: &Store, drv: &Derivation) -> Result<Instantiated> {
    let order = modulo::topo_sort(std::slice::from_ref(drv))?;
    for node in &order {
        node.validate()?;
    }
    let mut memo: HashMap<DrvId, Instantiated> = HashMap::new();
    for node in &order {
        instantiate_one(store, node, &mut memo).await?;
    }
    Ok(memo
        .remove(&drv.id())
        .expect("topological order contains the root"))
}

async fn instantiate_one(
    store: &Store,
    drv: &Derivation,
    memo: &mut HashMap<DrvId, Instantiated>,
) -> Result<()> {
    if memo.contains_key(&drv.id()) {
        return Ok(());
    }
    let drv_hash = {
        let mut hash_memo = HashMap::new();
        modulo::hash_modulo_inner(drv, &mut hash_memo)?
    };
    let out_path = match drv.output_hash() {
        Some(output_hash) => store.dir().make_fixed_output_path(
            output_hash.mode(),
            &output_hash.hash,
            drv.name(),
        )?,
        None => store
            .dir()
            .make_store_path("output:out", &drv_hash, drv.name())?,
    };
    let drv_path = store
        .dir()
        .make_store_path("output:out", &drv_hash, drv.name())?
        .to_drv_path();

    let mut input_srcs = Vec::new();
    if let Some(Source::Path(local)) = drv.src() {
        let src_path = store.add_source(local, None).await?;
        input_srcs.push(src_path.as_str().to_owned());
    }
    let base = std::env::current_dir().map_err(|e| Error::io(".", e))?;
    let builder = resolve_builder(store, &base, drv.builder_ref(), &mut input_srcs).await?;

    let system = drv.system();
    let mut env = drv.env().clone();
    env.insert("out".into(), out_path.as_str().to_owned());
    env.insert("name".into(), drv.name().to_owned());
    env.insert("system".into(), system.clone());
    env.insert("PATH".into(), "/path-not-set".into());
    env.insert("HOME".into(), "/homeless-shelter".into());
    env.insert("NIX_STORE".into(), store.dir().to_str().to_owned());

    let mut input_drvs = BTreeMap::new();
    for (i, input) in drv.inputs().enumerate() {
        let instantiated = memo
            .get(&input.id())
            .expect("inputs are instantiated before their consumers");
        input_drvs.insert(
            instantiated.drv_path.as_str().to_owned(),
            vec!["out".to_owned()],
        );
        env.insert(
            format!("input{}", i),
            instantiated.out_path.as_str().to_owned(),
        );
    }

    let mut outputs = BTreeMap::new();
    outputs.insert(
        "out".to_owned(),
        DrvOutput {
            path: out_path.as_str().to_owned(),
            hash: drv.output_hash().map(|h| h.hash.clone()),
            hash_algo: drv.output_hash().map(|h| {
                format!("{}sha256", h.mode().fingerprint_prefix())
            }),
        },
    );
    let drv_file = DrvFile {
        outputs,
        input_drvs,
        input_srcs,
        system,
        builder,
        args: drv.args().to_vec(),
        env,
    };
    store.add_drv(&drv_path, &drv_file).await?;
    debug!(name = drv.name(), drv_path = %drv_path, "instantiated");

    memo.insert(
        drv.id(),
        Instantiated { drv_path, out_path },
    );
    Ok(())
}

/// Resolves the builder reference: store paths and absolute host paths
/// pass through untouched, anything else is a local file, resolved
/// against `base`, that gets copied into the store and recorded as a
/// source input.
async fn resolve_builder(
    store: &Store,
    base: &Path,
    builder: &str,
    input_srcs: &mut Vec<String>,
) -> Result<String> {
    if store.dir().contains(builder) || builder.starts_with('/') {
        return Ok(builder.to_owned());
    }
    let builder_path = store.add_source(&base.join(builder), None).await?;
    input_srcs.push(builder_path.as_str().to_owned());
    Ok(builder_path.as_str().to_owned())
}
