//! Ordered registry of exportable tensors.
//!
//! The weights file carries no names: the position of a line is the only
//! thing identifying the tensor it holds. The registry therefore records
//! descriptors in exactly the order the network is constructed, and each
//! layer reports its own descriptors through [`ExportTensors`] so the order
//! follows from the topology alone.

use std::fmt;

use candle_core::Tensor;

/// Scope key of one normalization stage (`bn0`, `bn1`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BnKey(usize);

impl BnKey {
    /// Position of the stage in construction order
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for BnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bn{}", self.0)
    }
}

/// Issues one key per normalization stage, strictly increasing.
#[derive(Debug, Default)]
pub struct BnKeyAllocator {
    next: usize,
}

impl BnKeyAllocator {
    /// Create an allocator starting at `bn0`
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue the next key. Keys are never reused.
    pub fn allocate(&mut self) -> BnKey {
        let key = BnKey(self.next);
        self.next += 1;
        key
    }

    /// Number of keys issued so far
    pub fn issued(&self) -> usize {
        self.next
    }
}

/// Running statistic owned by a normalization stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Statistic {
    /// Running mean
    Mean,
    /// Running variance
    Variance,
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mean => f.write_str("moving_mean"),
            Self::Variance => f.write_str("moving_variance"),
        }
    }
}

/// Semantic role of an exported tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorRole {
    /// Convolution kernel, `[kh, kw, in, out]`
    ConvWeight,
    /// Constant zero convolution bias
    ConvBias,
    /// Running mean of a normalization stage
    BnMovingMean,
    /// Running variance of a normalization stage
    BnMovingVariance,
    /// Fully connected weight, `[in, out]`
    FcWeight,
    /// Fully connected bias
    FcBias,
}

impl fmt::Display for TensorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ConvWeight => "conv-weight",
            Self::ConvBias => "conv-bias",
            Self::BnMovingMean => "bn-moving-mean",
            Self::BnMovingVariance => "bn-moving-variance",
            Self::FcWeight => "fc-weight",
            Self::FcBias => "fc-bias",
        };
        f.write_str(name)
    }
}

/// Where the values of a descriptor live.
#[derive(Debug, Clone)]
pub enum TensorSource {
    /// Handle sharing storage with a parameter; reads see in-place updates.
    Direct(Tensor),
    /// Buffer owned by the normalization stage `scope`.
    Statistic { scope: BnKey, stat: Statistic },
}

/// One line of the weights file.
#[derive(Debug, Clone)]
pub struct TensorDescriptor {
    pub role: TensorRole,
    pub source: TensorSource,
}

impl TensorDescriptor {
    /// Descriptor over a parameter tensor
    pub fn direct(role: TensorRole, tensor: &Tensor) -> Self {
        Self {
            role,
            source: TensorSource::Direct(tensor.clone()),
        }
    }

    /// Descriptor referencing a running statistic of a normalization stage
    pub fn statistic(scope: BnKey, stat: Statistic) -> Self {
        let role = match stat {
            Statistic::Mean => TensorRole::BnMovingMean,
            Statistic::Variance => TensorRole::BnMovingVariance,
        };
        Self {
            role,
            source: TensorSource::Statistic { scope, stat },
        }
    }
}

/// Layers report the tensors they contribute to the weights file, in order.
pub trait ExportTensors {
    fn descriptors(&self) -> Vec<TensorDescriptor>;
}

/// Resolves statistic references at export time.
pub trait StatisticsLookup {
    /// Current value of `stat` for the stage `scope`, if such a stage exists.
    fn statistic(&self, scope: BnKey, stat: Statistic) -> Option<Tensor>;
}

/// Ordered, immutable sequence of descriptors.
#[derive(Debug, Clone, Default)]
pub struct ParameterRegistry {
    entries: Vec<TensorDescriptor>,
}

impl ParameterRegistry {
    /// Concatenate the descriptors of `layers` in the given order.
    pub fn from_layers(layers: &[&dyn ExportTensors]) -> Self {
        let entries = layers.iter().flat_map(|layer| layer.descriptors()).collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TensorDescriptor> {
        self.entries.iter()
    }

    /// Roles in export order
    pub fn roles(&self) -> Vec<TensorRole> {
        self.entries.iter().map(|d| d.role).collect()
    }

    /// Scope keys of statistic references, in export order, deduplicated.
    pub fn statistic_scopes(&self) -> Vec<BnKey> {
        let mut scopes: Vec<BnKey> = Vec::new();
        for descriptor in &self.entries {
            if let TensorSource::Statistic { scope, .. } = descriptor.source {
                if scopes.last() != Some(&scope) {
                    scopes.push(scope);
                }
            }
        }
        scopes
    }
}
