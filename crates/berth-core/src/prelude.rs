//! Commonly used types, for glob import.
//!
//! ```
//! use berth_core::prelude::*;
//! ```

pub use crate::component::{ComponentId, ComponentKind, Scope, Target};
pub use crate::dirs::BerthHome;
pub use crate::notice::{Notice, NoticeLevel, Notifier};
pub use crate::requirement::VersionReq;
pub use crate::version::{CompatLine, Version};
