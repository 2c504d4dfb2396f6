//! The DTLS collaborator seam.
//!
//! Secure transport (port 5684) is optional and lives outside the engine;
//! only the hook points are defined here. A DTLS implementation decrypts
//! inbound datagrams before they reach [`crate::Context::receive`] and
//! encrypts outbound ones behind the [`crate::Transport`] seam, pulling
//! key material through [`Credentials`].

use net::ip::SocketAddr;

use crate::Transport;

/// Key material callbacks a DTLS session pulls from the application.
pub trait Credentials {
	/// The pre-shared key for an identity hint, when PSK cipher suites are
	/// in use.
	fn psk(&self, identity: &[u8]) -> Option<Vec<u8>>;

	/// Our raw ECDSA key pair, when raw-public-key suites are in use.
	fn ecdsa_key(&self) -> Option<(Vec<u8>, Vec<u8>)>;

	/// Whether the peer's presented raw public key is acceptable.
	fn verify_ecdsa_key(&self, _peer: SocketAddr, _pub_x: &[u8], _pub_y: &[u8]) -> Result<(), ()> {
		Err(())
	}
}

/// Session lifecycle hooks of a DTLS implementation.
pub trait Dtls {
	/// Creates session state for a peer (server side, on first record).
	fn new_session(&mut self, peer: SocketAddr) -> Result<(), ()>;

	/// Starts a handshake towards a server (client side).
	fn connect(&mut self, peer: SocketAddr) -> Result<(), ()>;

	/// Encrypts and transmits one application datagram.
	fn write(&mut self, peer: SocketAddr, data: &[u8]) -> Result<(), ()>;

	/// Feeds one ciphertext record in; yields the decrypted application
	/// datagram once the handshake is done.
	fn handle_message(&mut self, peer: SocketAddr, data: &[u8]) -> Option<Vec<u8>>;

	/// Tears a session down.
	fn free(&mut self, peer: SocketAddr);
}

/// Adapts a DTLS session stack into the engine's [`Transport`] seam, so a
/// `Context<Secure<D>>` speaks coaps without the engine knowing.
pub struct Secure<D: Dtls> {
	inner: D,
}

impl<D: Dtls> Secure<D> {
	pub fn new(inner: D) -> Self {
		Self { inner }
	}

	pub fn sessions(&mut self) -> &mut D {
		&mut self.inner
	}
}

impl<D: Dtls> Transport for Secure<D> {
	fn send(&mut self, to: SocketAddr, data: &[u8]) -> Result<(), ()> {
		self.inner.write(to, data)
	}
}
