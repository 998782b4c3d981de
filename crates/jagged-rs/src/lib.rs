extern crate self as jagged_rs;

mod env;
pub mod nested;
pub mod ops;
pub mod symbolic;
pub mod tensor;
pub mod weak;

pub use nested::{
    jagged_from_list, jagged_from_tensor_and_lengths, EquivalenceRegistry, JaggedError,
    JaggedTensor, RegistryConfig, RegistryError,
};
pub use ops::{default_jagged_ops, JaggedOpTable, OpKey, OpValue};
pub use symbolic::{NestedInt, RegistryId, SymInt, TensorId};
pub use tensor::{DType, Device, Shape, Tensor, TensorKind};
