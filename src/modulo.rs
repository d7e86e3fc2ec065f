//! Derivation-modulo hashing and derivation-graph traversal.
//!
//! The modulo hash collapses a derivation graph into a single
//! fingerprint by replacing each input with its own modulo hash and
//! emptying the output paths. Fixed-output derivations short-circuit:
//! their hash derives from the declared content alone.

use std::collections::{HashMap, HashSet};

use thiserror::Error;
use tracing::trace;

use crate::canon::{self, Value};
use crate::derivation::{Derivation, DrvId, Source};
use crate::error::Error;
use crate::hash;

/// A cycle in the derivation graph. `path` lists the names along the
/// offending walk, first name repeated at the end.
#[derive(Error, Debug, PartialEq, Eq, Clone)]
#[error("derivation graph forms a cycle: {}", path.join(" -> "))]
pub struct CycleError {
    pub path: Vec<String>,
}

/// Computes the derivation-modulo hash, 64 lowercase hex characters.
///
/// The graph is checked for cycles before any hashing happens; the memo
/// below is a pure cache and would otherwise terminate on a cycle with a
/// partial entry.
pub fn hash_derivation_modulo(drv: &Derivation) -> Result<String, Error> {
    check_acyclic(drv)?;
    let mut memo = HashMap::new();
    hash_modulo_inner(drv, &mut memo)
}

pub(crate) fn check_acyclic(drv: &Derivation) -> Result<(), CycleError> {
    topo_sort(std::slice::from_ref(drv)).map(|_| ())
}

pub(crate) fn hash_modulo_inner(
    drv: &Derivation,
    memo: &mut HashMap<DrvId, String>,
) -> Result<String, Error> {
    if let Some(cached) = memo.get(&drv.id()) {
        return Ok(cached.clone());
    }
    let hex = if let Some(output_hash) = drv.output_hash() {
        // Fixed output: identity comes from the declared content only.
        let fingerprint = format!(
            "fixed:out:{}sha256:{}:",
            output_hash.mode().fingerprint_prefix(),
            output_hash.hash
        );
        hash::digest_hex(&fingerprint)
    } else {
        let mut inputs = Value::object();
        for input in drv.inputs() {
            let input_hash = hash_modulo_inner(input, memo)?;
            // Identical hash keys merge, which is what turns the input
            // sequence into a set.
            inputs.insert(input_hash, Value::from(vec!["out"]));
        }
        let mut outputs = Value::object();
        outputs.insert("out".into(), Value::from(""));

        let mut record = Value::object();
        record.insert("name".into(), Value::from(drv.name()));
        record.insert("system".into(), Value::from(drv.system()));
        record.insert("builder".into(), Value::from(drv.builder_ref()));
        record.insert("args".into(), Value::from(drv.args().to_vec()));
        record.insert("env".into(), Value::from(drv.env().clone()));
        record.insert("inputs".into(), Value::Object(inputs));
        record.insert("outputs".into(), Value::Object(outputs));
        match drv.src() {
            Some(Source::Path(path)) => {
                record.insert(
                    "src".into(),
                    Value::from(path.to_string_lossy().into_owned()),
                );
            }
            Some(Source::Fixed(fingerprint)) => {
                record.insert("src".into(), Value::from(fingerprint.as_str()));
            }
            None => {}
        }
        let bytes = canon::to_bytes(&Value::Object(record))?;
        hash::digest_hex(&bytes)
    };
    trace!(name = drv.name(), hash = %hex, "derivation modulo hash");
    memo.insert(drv.id(), hex.clone());
    Ok(hex)
}

/// Orders the graph reachable from `roots` so every input precedes its
/// consumers; each distinct node appears exactly once.
pub fn topo_sort(roots: &[Derivation]) -> Result<Vec<Derivation>, CycleError> {
    let mut visited = HashSet::new();
    let mut stack = Vec::new();
    let mut order = Vec::new();
    for root in roots {
        visit(root, &mut visited, &mut stack, &mut order)?;
    }
    Ok(order)
}

fn visit(
    drv: &Derivation,
    visited: &mut HashSet<DrvId>,
    stack: &mut Vec<(DrvId, String)>,
    order: &mut Vec<Derivation>,
) -> Result<(), CycleError> {
    let id = drv.id();
    if let Some(pos) = stack.iter().position(|(on_stack, _)| *on_stack == id) {
        let mut path: Vec<String> = stack[pos..].iter().map(|(_, name)| name.clone()).collect();
        path.push(drv.name().to_owned());
        return Err(CycleError { path });
    }
    if !visited.insert(id) {
        return Ok(());
    }
    stack.push((id, drv.name().to_owned()));
    for input in drv.inputs() {
        visit(input, visited, stack, order)?;
    }
    stack.pop();
    order.push(drv.clone());
    Ok(())
}

/// The set of transitively reachable inputs, exclusive of `drv` itself,
/// deduplicated on identity. Order is unspecified.
pub fn all_deps(drv: &Derivation) -> Vec<Derivation> {
    let mut seen: HashSet<DrvId> = HashSet::new();
    seen.insert(drv.id());
    let mut pending: Vec<Derivation> = drv.inputs().cloned().collect();
    let mut deps = Vec::new();
    while let Some(next) = pending.pop() {
        if seen.insert(next.id()) {
            pending.extend(next.inputs().cloned());
            deps.push(next);
        }
    }
    deps
}
