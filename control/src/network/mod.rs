//! Secondary networks
//!
//! - `attachment`: GetIPs, resolving a pod's addresses on a secondary network
//! - `table`: the shared table id pool and the published assignment format

pub mod attachment;
pub mod table;

pub use attachment::{AttachmentSource, AttachmentState, MultusAttachments};
pub use table::{NetworkAssignment, NetworkKey, PodKey, PublishedNetworks, TableIds};
