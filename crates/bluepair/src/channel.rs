//! Interfaces between the pairing engine and its host stack
//!
//! The engine is single threaded and callback driven. The host feeds it
//! inbound PDUs, encryption events and user responses; the engine drives
//! the channel, the link layer and the listener back.

use crate::constants::SMP_PAIRING_TIMEOUT_MS;
use crate::keys::{IdentityInfo, LinkKey};
use crate::types::SecurityProperties;
use std::time::{Duration, Instant};

/// Outbound half of the SMP fixed channel. Sends are fire and forget;
/// transport failure surfaces later as a channel-closed event.
pub trait PairingChannel {
    fn send_message(&mut self, pdu: &[u8]);
}

/// The link-layer encryption controls the engine drives
pub trait LinkEncrypter {
    /// Begin encrypting the link with the given key (initiator role).
    fn start_encryption(&mut self, key: &LinkKey);

    /// Hand the key the controller should answer an encryption request
    /// with (responder role).
    fn assign_long_term_key(&mut self, key: &LinkKey);

    /// Tear the link down after an unrecoverable failure.
    fn disconnect(&mut self);
}

/// Identifies one pairing attempt. Tokens from an aborted or completed
/// attempt are stale; responding through one is a harmless no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingToken {
    pub(crate) epoch: u64,
}

/// User interaction and host policy callbacks
pub trait PairingListener {
    /// Ask the user to approve pairing. `comparison_value` carries the
    /// 6-digit number for numeric comparison, `None` for Just Works.
    /// Answer via [`SecurityManager::confirm`](crate::SecurityManager::confirm).
    fn confirm_pairing(&mut self, token: PairingToken, comparison_value: Option<u32>);

    /// Show the user a passkey the peer will type.
    fn display_passkey(&mut self, token: PairingToken, passkey: u32);

    /// Ask the user for the passkey shown on the peer. Answer via
    /// [`SecurityManager::provide_passkey`](crate::SecurityManager::provide_passkey).
    fn request_passkey(&mut self, token: PairingToken);

    /// The local IRK and identity address to distribute, if this device
    /// has an identity to share.
    fn identity_info(&mut self) -> Option<IdentityInfo>;

    /// The security of the link changed (pairing completed, or keys from
    /// an earlier bond were brought into effect).
    fn on_security_changed(&mut self, security: SecurityProperties) {
        let _ = security;
    }
}

/// Outbound PDU path handed into phase logic. Every send re-arms the
/// 30 second pairing timer.
pub struct PduSink<'a> {
    channel: &'a mut dyn PairingChannel,
    deadline: &'a mut Option<Instant>,
    now: Instant,
}

impl<'a> PduSink<'a> {
    pub fn new(
        channel: &'a mut dyn PairingChannel,
        deadline: &'a mut Option<Instant>,
        now: Instant,
    ) -> Self {
        Self {
            channel,
            deadline,
            now,
        }
    }

    pub fn send(&mut self, pdu: Vec<u8>) {
        *self.deadline = Some(self.now + Duration::from_millis(SMP_PAIRING_TIMEOUT_MS));
        self.channel.send_message(&pdu);
    }

    pub fn now(&self) -> Instant {
        self.now
    }
}
