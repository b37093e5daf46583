//! Hierarchical tensor lookup over a `WeightStore`.
//!
//! A `VarBuilder` is a cheap cursor holding a dot-joined path prefix;
//! `pp("self_attn")` descends, `get((out, in), "weight")` resolves the
//! full name, shape-checks and copies the bytes into a fresh tensor.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::tensor::Tensor;

use super::store::WeightStore;

#[derive(Clone)]
pub struct VarBuilder {
    store: Arc<WeightStore>,
    prefix: String,
}

impl VarBuilder {
    pub fn new(store: Arc<WeightStore>) -> Self {
        Self { store, prefix: String::new() }
    }

    /// Descends one path component. Whitespace is trimmed; empty parts
    /// are skipped.
    pub fn pp(&self, part: impl AsRef<str>) -> VarBuilder {
        let part = part.as_ref().trim();
        if part.is_empty() {
            return self.clone();
        }
        let prefix = if self.prefix.is_empty() {
            part.to_string()
        } else {
            format!("{}.{}", self.prefix, part)
        };
        VarBuilder { store: Arc::clone(&self.store), prefix }
    }

    /// Descends several components at once.
    pub fn path(&self, parts: &[&str]) -> VarBuilder {
        parts.iter().fold(self.clone(), |vb, p| vb.pp(p))
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn full_name(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", self.prefix, name)
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.store.contains(&self.full_name(name))
    }

    /// Resolves, shape-checks and copies out a tensor.
    pub fn get(&self, shape: &[usize], name: &str) -> Result<Tensor> {
        let t = self.get_any(name)?;
        if t.shape() != shape {
            return Err(Error::ShapeMismatch {
                op: "var_builder",
                expected: shape.to_vec(),
                got: t.shape().to_vec(),
            });
        }
        Ok(t)
    }

    /// Resolves and copies out a tensor with whatever shape the
    /// checkpoint records.
    pub fn get_any(&self, name: &str) -> Result<Tensor> {
        self.store.tensor(&self.full_name(name))
    }

    /// `Ok(None)` when the tensor is absent, errors only on real faults.
    pub fn get_opt(&self, name: &str) -> Result<Option<Tensor>> {
        if !self.contains(name) {
            return Ok(None);
        }
        self.get_any(name).map(Some)
    }

    /// Shape of a stored tensor without copying its data.
    pub fn shape_of(&self, name: &str) -> Result<Vec<usize>> {
        let full = self.full_name(name);
        self.store
            .info(&full)
            .map(|i| i.shape.clone())
            .ok_or(Error::TensorNotFound(full))
    }
}

impl std::fmt::Debug for VarBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VarBuilder").field("prefix", &self.prefix).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weights::store::testing::build_safetensors;

    fn store() -> Arc<WeightStore> {
        WeightStore::from_bytes(build_safetensors(&[
            ("flow_lm.input_linear.weight", &[2, 3], vec![0.0; 6]),
            ("flow_lm.input_linear.bias", &[2], vec![1.0, 2.0]),
        ]))
        .unwrap()
    }

    #[test]
    fn prefix_resolution() {
        let vb = VarBuilder::new(store());
        let lin = vb.pp("flow_lm").pp("input_linear");
        assert_eq!(lin.prefix(), "flow_lm.input_linear");
        let w = lin.get(&[2, 3], "weight").unwrap();
        assert_eq!(w.shape(), &[2, 3]);
        assert!(lin.get(&[3, 2], "weight").is_err());
        assert!(matches!(lin.get_any("missing"), Err(Error::TensorNotFound(_))));
    }

    #[test]
    fn path_trims_and_skips_empty_parts() {
        let vb = VarBuilder::new(store());
        let lin = vb.path(&[" flow_lm ", "", "input_linear"]);
        assert_eq!(lin.prefix(), "flow_lm.input_linear");
        assert!(lin.contains("bias"));
    }

    #[test]
    fn optional_lookup() {
        let vb = VarBuilder::new(store()).pp("flow_lm.input_linear");
        assert!(vb.get_opt("bias").unwrap().is_some());
        assert!(vb.get_opt("gamma").unwrap().is_none());
    }
}
