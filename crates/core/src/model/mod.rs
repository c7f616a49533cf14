pub mod call_site;
pub mod node;
pub mod thread_node;

pub use call_site::{CallSite, CallSiteLocation, StackFrame};
pub use node::{Node, WindowTimes};
pub use thread_node::ThreadNode;
