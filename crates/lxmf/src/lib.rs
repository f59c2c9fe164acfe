pub mod error;
pub mod message;
pub mod propagation;
pub mod router;

pub use crate::error::LxmfError;
pub use crate::message::{LxmfMessage, MessageState};
pub use crate::propagation::{PropagationManager, PropagationSelection};
pub use crate::router::{Adapter, LxmfRouter, RouterEvent};
