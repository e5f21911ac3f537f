pub mod backbone;
pub mod cflow;
pub mod dfkde;
pub mod dfm;
pub mod draem;
pub mod error;
pub mod fastflow;
pub mod ganomaly;
mod init;
pub mod padim;
pub mod patchcore;
pub mod registry;
pub mod resolver;
pub mod reverse_distillation;
pub mod stfpm;

pub use crate::cflow::*;
pub use crate::dfkde::*;
pub use crate::dfm::*;
pub use crate::draem::*;
pub use crate::error::*;
pub use crate::fastflow::*;
pub use crate::ganomaly::*;
pub use crate::padim::*;
pub use crate::patchcore::*;
pub use crate::registry::*;
pub use crate::resolver::*;
pub use crate::reverse_distillation::*;
pub use crate::stfpm::*;
