//! gnuleaf-core — wire formats and protocol algorithms for the GnuLeaf
//! servent: the descriptor codec, the 0.6 handshake text, QRP, GUIDs, and
//! daemon configuration. No sockets live here.

pub mod codec;
pub mod config;
pub mod descriptor;
pub mod guid;
pub mod handshake;
pub mod qrp;
