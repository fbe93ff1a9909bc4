/*! Wire formats of the mixnet protocol.

Pure data structures with `FromBytes`/`ToBytes` implementations; no
I/O and no state. The engine lives in `mixnet_core`.
*/

#![forbid(unsafe_code)]

pub mod circuit;
pub mod descriptor;
pub mod errors;
pub mod ip_port;
pub mod onion;
pub mod packet;
pub mod relay_node;

pub use self::circuit::*;
pub use self::descriptor::*;
pub use self::errors::*;
pub use self::ip_port::*;
pub use self::onion::*;
pub use self::packet::*;
pub use self::relay_node::*;
