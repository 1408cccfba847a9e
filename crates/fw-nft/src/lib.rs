pub mod compile;
pub mod conn;
pub mod expr;
pub mod identity;
pub mod memory;
pub mod netlink;
mod nla;
pub mod reconcile;
pub mod status;
pub mod table;

pub use compile::*;
pub use conn::*;
pub use expr::*;
pub use identity::*;
pub use memory::*;
pub use netlink::NetlinkConn;
pub use nla::DecodeError;
pub use reconcile::*;
pub use status::*;
pub use table::*;
