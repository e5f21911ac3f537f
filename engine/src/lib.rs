pub mod checkpoint;
pub mod module;
pub mod state_dict;
pub mod tensor;

pub use crate::checkpoint::*;
pub use crate::module::*;
pub use crate::state_dict::*;
pub use crate::tensor::*;
