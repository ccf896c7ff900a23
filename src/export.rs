//! Version 1 text weights format.
//!
//! The file is a version line followed by one line per registry entry, in
//! registry order. Each line holds the tensor's values as space-separated
//! decimals after re-laying out the axes into the order the inference engine
//! reads:
//!
//! | Rank | Stored              | Written             |
//! |------|---------------------|---------------------|
//! | 4    | `[kh, kw, in, out]` | `[out, in, kh, kw]` |
//! | 2    | `[in, out]`         | `[out, in]`         |
//! | 1    | `[n]`               | `[n]`               |
//!
//! Lines are joined by `\n` with no trailing newline.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use candle_core::{DType, Tensor};

use crate::error::{LeelazError, LeelazResult};
use crate::registry::{ParameterRegistry, StatisticsLookup, TensorDescriptor, TensorSource};

/// First line of every weights file.
pub const FORMAT_VERSION: &str = "1";

/// Serializes a registry into the version 1 weights format.
pub struct WeightExporter<'a, L: StatisticsLookup> {
    registry: &'a ParameterRegistry,
    lookup: &'a L,
}

impl<'a, L: StatisticsLookup> WeightExporter<'a, L> {
    pub fn new(registry: &'a ParameterRegistry, lookup: &'a L) -> Self {
        Self { registry, lookup }
    }

    /// Write the full file to `out`.
    ///
    /// # Errors
    ///
    /// Returns an error on an unresolvable statistic reference, a tensor of
    /// unsupported rank, or a write failure. Output already written is left
    /// as is.
    pub fn write<W: Write>(&self, out: &mut W) -> LeelazResult<()> {
        out.write_all(FORMAT_VERSION.as_bytes())?;
        for descriptor in self.registry.iter() {
            let values = self.values(descriptor)?;
            out.write_all(b"\n")?;
            let mut first = true;
            for v in values {
                if !first {
                    out.write_all(b" ")?;
                }
                first = false;
                write!(out, "{v}")?;
            }
        }
        out.flush()?;
        Ok(())
    }

    /// Write the weights file at `path`, replacing any existing file.
    pub fn save(&self, path: impl AsRef<Path>) -> LeelazResult<()> {
        let path = path.as_ref();
        let mut out = BufWriter::new(File::create(path)?);
        self.write(&mut out)?;
        tracing::info!(
            "Exported {} tensors to {}",
            self.registry.len(),
            path.display()
        );
        Ok(())
    }

    /// Re-laid-out values of one entry.
    fn values(&self, descriptor: &TensorDescriptor) -> LeelazResult<Vec<f32>> {
        let tensor = match &descriptor.source {
            TensorSource::Direct(t) => t.clone(),
            TensorSource::Statistic { scope, stat } => {
                let t = self.lookup.statistic(*scope, *stat).ok_or_else(|| {
                    LeelazError::UnresolvedReference(format!("{scope}.{stat}"))
                })?;
                if t.rank() != 1 {
                    return Err(LeelazError::UnsupportedRank {
                        rank: t.rank(),
                        role: descriptor.role.to_string(),
                    });
                }
                t
            }
        };
        let tensor = export_layout(&tensor).map_err(|e| match e {
            LeelazError::UnsupportedRank { rank, .. } => LeelazError::UnsupportedRank {
                rank,
                role: descriptor.role.to_string(),
            },
            other => other,
        })?;
        Ok(tensor.to_dtype(DType::F32)?.to_vec1::<f32>()?)
    }
}

/// Permute a stored tensor into export order and flatten it.
pub fn export_layout(tensor: &Tensor) -> LeelazResult<Tensor> {
    let laid_out = match tensor.rank() {
        4 => tensor.permute((3, 2, 0, 1))?,
        2 => tensor.t()?,
        1 => tensor.clone(),
        rank => {
            return Err(LeelazError::UnsupportedRank {
                rank,
                role: "tensor".to_string(),
            })
        }
    };
    Ok(laid_out.contiguous()?.flatten_all()?)
}
