//! Legacy pairing Phase 2: TK selection, confirm exchange and STK
//!
//! Both devices commit to a random value with `c1` before revealing it.
//! The initiator always discloses its confirm first, so a dishonest peer
//! learns nothing it can replay. The STK that comes out of `s1` encrypts
//! the link for Phase 3.

use crate::address::DeviceAddress;
use crate::channel::PduSink;
use crate::crypto;
use crate::error::{Error, ErrorCode, Result};
use crate::keys::LinkKey;
use crate::pdu::{PairingConfirm, PairingRandom};
use crate::types::{PairingMethod, Role};

/// What the manager must do after feeding the phase an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyAction {
    None,
    /// Show this passkey; the peer will type it
    DisplayPasskey(u32),
    /// Ask the user for the passkey shown on the peer
    RequestPasskey,
    /// Phase 2 is done. Encrypt the link with this STK (initiator) or
    /// hand it to the controller (responder).
    KeyReady(LinkKey),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    /// TK not known yet (passkey entry or OOB pending)
    WaitingTk,
    /// Confirm sent (initiator) or awaited (responder)
    ConfirmExchange,
    /// Confirms exchanged; randoms in flight
    RandomExchange,
    Complete,
}

/// Legacy Phase 2 state machine, one per pairing attempt
pub struct LegacyPhase2 {
    role: Role,
    method: PairingMethod,
    key_size: u8,
    local_addr: DeviceAddress,
    peer_addr: DeviceAddress,
    /// Pairing Request and Response as sent on the wire; inputs to c1
    preq: [u8; 7],
    pres: [u8; 7],
    tk: Option<[u8; 16]>,
    local_rand: [u8; 16],
    peer_confirm: Option<[u8; 16]>,
    peer_rand: Option<[u8; 16]>,
    state: State,
}

fn tk_from_passkey(passkey: u32) -> [u8; 16] {
    let mut tk = [0u8; 16];
    tk[12..16].copy_from_slice(&passkey.to_be_bytes());
    tk
}

/// Zero the most significant octets down to the negotiated key size.
pub(crate) fn mask_key_size(mut key: [u8; 16], key_size: u8) -> [u8; 16] {
    let zeroed = 16usize.saturating_sub(key_size as usize);
    for byte in key.iter_mut().take(zeroed) {
        *byte = 0;
    }
    key
}

impl LegacyPhase2 {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        role: Role,
        method: PairingMethod,
        key_size: u8,
        preq: [u8; 7],
        pres: [u8; 7],
        local_addr: DeviceAddress,
        peer_addr: DeviceAddress,
        oob_tk: Option<[u8; 16]>,
    ) -> Self {
        let tk = match method {
            PairingMethod::JustWorks => Some([0u8; 16]),
            PairingMethod::OutOfBand => oob_tk,
            _ => None,
        };
        Self {
            role,
            method,
            key_size,
            local_addr,
            peer_addr,
            preq,
            pres,
            tk,
            local_rand: crypto::random_128(),
            peer_confirm: None,
            peer_rand: None,
            state: State::Idle,
        }
    }

    /// Kick the phase off. May emit the initiator's confirm, or ask for
    /// user input first.
    pub fn start(&mut self, sink: &mut PduSink<'_>) -> Result<LegacyAction> {
        if self.state != State::Idle {
            return Err(Error::InvalidState);
        }
        match self.method {
            PairingMethod::PasskeyEntryDisplay => {
                let passkey = crypto::generate_passkey();
                self.tk = Some(tk_from_passkey(passkey));
                self.tk_ready(sink)?;
                Ok(LegacyAction::DisplayPasskey(passkey))
            }
            PairingMethod::PasskeyEntryInput => {
                self.state = State::WaitingTk;
                Ok(LegacyAction::RequestPasskey)
            }
            _ => {
                if self.tk.is_none() {
                    // OOB agreed but no data on this side.
                    return Err(Error::Protocol(ErrorCode::OobNotAvailable));
                }
                self.tk_ready(sink)?;
                Ok(LegacyAction::None)
            }
        }
    }

    /// The user typed the passkey shown on the peer.
    pub fn passkey_entered(
        &mut self,
        passkey: u32,
        sink: &mut PduSink<'_>,
    ) -> Result<LegacyAction> {
        if self.state != State::WaitingTk || self.tk.is_some() {
            return Err(Error::InvalidState);
        }
        self.tk = Some(tk_from_passkey(passkey));
        self.tk_ready(sink)?;
        Ok(LegacyAction::None)
    }

    fn tk_ready(&mut self, sink: &mut PduSink<'_>) -> Result<()> {
        match self.role {
            Role::Initiator => {
                self.send_confirm(sink)?;
                self.state = State::ConfirmExchange;
            }
            Role::Responder => {
                // The initiator's confirm may already be queued up.
                if self.peer_confirm.is_some() {
                    self.send_confirm(sink)?;
                    self.state = State::RandomExchange;
                } else {
                    self.state = State::ConfirmExchange;
                }
            }
        }
        Ok(())
    }

    fn send_confirm(&mut self, sink: &mut PduSink<'_>) -> Result<()> {
        let tk = self.tk.ok_or(Error::InvalidState)?;
        let (initiator, responder) = self.addresses();
        let confirm = crypto::c1(
            &tk,
            &self.local_rand,
            &self.preq,
            &self.pres,
            initiator,
            responder,
        );
        sink.send(PairingConfirm::new(confirm).serialize());
        Ok(())
    }

    fn addresses(&self) -> (&DeviceAddress, &DeviceAddress) {
        match self.role {
            Role::Initiator => (&self.local_addr, &self.peer_addr),
            Role::Responder => (&self.peer_addr, &self.local_addr),
        }
    }

    pub fn on_confirm(
        &mut self,
        confirm: PairingConfirm,
        sink: &mut PduSink<'_>,
    ) -> Result<LegacyAction> {
        if self.peer_confirm.is_some() {
            return Err(Error::Protocol(ErrorCode::UnspecifiedReason));
        }
        match (self.role, self.state) {
            (Role::Initiator, State::ConfirmExchange) => {
                self.peer_confirm = Some(confirm.value);
                sink.send(PairingRandom::new(self.local_rand).serialize());
                self.state = State::RandomExchange;
                Ok(LegacyAction::None)
            }
            // A responder may see the initiator's confirm while the user
            // is still typing the passkey.
            (Role::Responder, State::WaitingTk) => {
                self.peer_confirm = Some(confirm.value);
                Ok(LegacyAction::None)
            }
            (Role::Responder, State::ConfirmExchange) => {
                self.peer_confirm = Some(confirm.value);
                self.send_confirm(sink)?;
                self.state = State::RandomExchange;
                Ok(LegacyAction::None)
            }
            _ => Err(Error::Protocol(ErrorCode::UnspecifiedReason)),
        }
    }

    pub fn on_random(
        &mut self,
        random: PairingRandom,
        sink: &mut PduSink<'_>,
    ) -> Result<LegacyAction> {
        if self.state != State::RandomExchange || self.peer_rand.is_some() {
            return Err(Error::Protocol(ErrorCode::UnspecifiedReason));
        }
        let tk = self.tk.ok_or(Error::InvalidState)?;
        let peer_confirm = self
            .peer_confirm
            .ok_or(Error::Protocol(ErrorCode::UnspecifiedReason))?;

        // The peer's random must reproduce the confirm it committed to.
        let (initiator, responder) = self.addresses();
        let check = crypto::c1(
            &tk,
            &random.value,
            &self.preq,
            &self.pres,
            initiator,
            responder,
        );
        if check != peer_confirm {
            return Err(Error::Protocol(ErrorCode::ConfirmValueFailed));
        }
        self.peer_rand = Some(random.value);

        let (initiator_rand, responder_rand) = match self.role {
            Role::Initiator => (self.local_rand, random.value),
            Role::Responder => (random.value, self.local_rand),
        };
        if self.role == Role::Responder {
            sink.send(PairingRandom::new(self.local_rand).serialize());
        }
        self.state = State::Complete;
        let stk = mask_key_size(
            crypto::s1(&tk, &responder_rand, &initiator_rand),
            self.key_size,
        );
        Ok(LegacyAction::KeyReady(LinkKey::with_value(stk)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::PairingChannel;
    use crate::pdu::Command;
    use std::time::Instant;

    struct Outbox {
        sent: Vec<Vec<u8>>,
    }

    impl PairingChannel for Outbox {
        fn send_message(&mut self, pdu: &[u8]) {
            self.sent.push(pdu.to_vec());
        }
    }

    const PREQ: [u8; 7] = [0x01, 0x03, 0x00, 0x01, 0x10, 0x03, 0x03];
    const PRES: [u8; 7] = [0x02, 0x03, 0x00, 0x01, 0x10, 0x03, 0x03];

    fn initiator_addr() -> DeviceAddress {
        DeviceAddress::public([0xA6, 0xA5, 0xA4, 0xA3, 0xA2, 0xA1])
    }

    fn responder_addr() -> DeviceAddress {
        DeviceAddress::public([0xB6, 0xB5, 0xB4, 0xB3, 0xB2, 0xB1])
    }

    fn phase(role: Role, method: PairingMethod) -> LegacyPhase2 {
        LegacyPhase2::new(
            role,
            method,
            16,
            PREQ,
            PRES,
            match role {
                Role::Initiator => initiator_addr(),
                Role::Responder => responder_addr(),
            },
            match role {
                Role::Initiator => responder_addr(),
                Role::Responder => initiator_addr(),
            },
            None,
        )
    }

    fn drive(
        outbox: &mut Outbox,
        deadline: &mut Option<Instant>,
        f: impl FnOnce(&mut PduSink<'_>) -> Result<LegacyAction>,
    ) -> Result<LegacyAction> {
        let mut sink = PduSink::new(outbox, deadline, Instant::now());
        f(&mut sink)
    }

    fn sent_confirm(outbox: &Outbox, index: usize) -> PairingConfirm {
        match Command::parse(&outbox.sent[index]).unwrap() {
            Command::PairingConfirm(c) => c,
            other => panic!("expected confirm, got {:?}", other),
        }
    }

    fn sent_random(outbox: &Outbox, index: usize) -> PairingRandom {
        match Command::parse(&outbox.sent[index]).unwrap() {
            Command::PairingRandom(r) => r,
            other => panic!("expected random, got {:?}", other),
        }
    }

    #[test]
    fn just_works_exchange_agrees_on_stk() {
        let mut init = phase(Role::Initiator, PairingMethod::JustWorks);
        let mut resp = phase(Role::Responder, PairingMethod::JustWorks);
        let mut init_out = Outbox { sent: Vec::new() };
        let mut resp_out = Outbox { sent: Vec::new() };
        let mut init_dl = None;
        let mut resp_dl = None;

        assert_eq!(
            drive(&mut init_out, &mut init_dl, |s| init.start(s)).unwrap(),
            LegacyAction::None
        );
        assert_eq!(
            drive(&mut resp_out, &mut resp_dl, |s| resp.start(s)).unwrap(),
            LegacyAction::None
        );
        assert!(init_dl.is_some());

        // Initiator confirm -> responder replies with its confirm.
        let mci = sent_confirm(&init_out, 0);
        drive(&mut resp_out, &mut resp_dl, |s| resp.on_confirm(mci, s)).unwrap();
        let sci = sent_confirm(&resp_out, 0);
        // Responder confirm -> initiator reveals its random.
        drive(&mut init_out, &mut init_dl, |s| init.on_confirm(sci, s)).unwrap();
        let mrand = sent_random(&init_out, 1);
        // Initiator random checks out; responder reveals its random and
        // finishes.
        let resp_key = match drive(&mut resp_out, &mut resp_dl, |s| resp.on_random(mrand, s)) {
            Ok(LegacyAction::KeyReady(key)) => key,
            other => panic!("unexpected: {:?}", other),
        };
        let srand = sent_random(&resp_out, 1);
        let init_key = match drive(&mut init_out, &mut init_dl, |s| init.on_random(srand, s)) {
            Ok(LegacyAction::KeyReady(key)) => key,
            other => panic!("unexpected: {:?}", other),
        };

        assert_eq!(init_key, resp_key);
        assert_eq!(init_key.ediv, 0);
        assert_eq!(init_key.rand, 0);
    }

    #[test]
    fn wrong_confirm_fails_with_confirm_value_failed() {
        let mut init = phase(Role::Initiator, PairingMethod::JustWorks);
        let mut out = Outbox { sent: Vec::new() };
        let mut dl = None;

        drive(&mut out, &mut dl, |s| init.start(s)).unwrap();
        drive(&mut out, &mut dl, |s| {
            init.on_confirm(PairingConfirm::new([0xEE; 16]), s)
        })
        .unwrap();
        let err = drive(&mut out, &mut dl, |s| {
            init.on_random(PairingRandom::new([0x11; 16]), s)
        })
        .unwrap_err();
        assert_eq!(err, Error::Protocol(ErrorCode::ConfirmValueFailed));
    }

    #[test]
    fn random_before_confirm_is_a_protocol_violation() {
        let mut init = phase(Role::Initiator, PairingMethod::JustWorks);
        let mut out = Outbox { sent: Vec::new() };
        let mut dl = None;

        drive(&mut out, &mut dl, |s| init.start(s)).unwrap();
        let err = drive(&mut out, &mut dl, |s| {
            init.on_random(PairingRandom::new([0x11; 16]), s)
        })
        .unwrap_err();
        assert_eq!(err, Error::Protocol(ErrorCode::UnspecifiedReason));
    }

    #[test]
    fn responder_holds_confirm_until_passkey_arrives() {
        let mut init = phase(Role::Initiator, PairingMethod::PasskeyEntryDisplay);
        let mut resp = phase(Role::Responder, PairingMethod::PasskeyEntryInput);
        let mut init_out = Outbox { sent: Vec::new() };
        let mut resp_out = Outbox { sent: Vec::new() };
        let mut init_dl = None;
        let mut resp_dl = None;

        let passkey = match drive(&mut init_out, &mut init_dl, |s| init.start(s)).unwrap() {
            LegacyAction::DisplayPasskey(p) => p,
            other => panic!("unexpected: {:?}", other),
        };
        assert!(passkey < 1_000_000);
        assert_eq!(
            drive(&mut resp_out, &mut resp_dl, |s| resp.start(s)).unwrap(),
            LegacyAction::RequestPasskey
        );

        // Initiator's confirm lands while the user is still typing.
        let mci = sent_confirm(&init_out, 0);
        drive(&mut resp_out, &mut resp_dl, |s| resp.on_confirm(mci, s)).unwrap();
        assert!(resp_out.sent.is_empty());

        // Passkey entry releases the responder confirm.
        drive(&mut resp_out, &mut resp_dl, |s| {
            resp.passkey_entered(passkey, s)
        })
        .unwrap();
        let sci = sent_confirm(&resp_out, 0);

        drive(&mut init_out, &mut init_dl, |s| init.on_confirm(sci, s)).unwrap();
        let mrand = sent_random(&init_out, 1);
        let resp_key = match drive(&mut resp_out, &mut resp_dl, |s| resp.on_random(mrand, s)) {
            Ok(LegacyAction::KeyReady(key)) => key,
            other => panic!("unexpected: {:?}", other),
        };
        let srand = sent_random(&resp_out, 1);
        let init_key = match drive(&mut init_out, &mut init_dl, |s| init.on_random(srand, s)) {
            Ok(LegacyAction::KeyReady(key)) => key,
            other => panic!("unexpected: {:?}", other),
        };
        assert_eq!(init_key, resp_key);
    }

    #[test]
    fn mismatched_passkeys_fail_the_exchange() {
        let mut init = phase(Role::Initiator, PairingMethod::PasskeyEntryDisplay);
        let mut resp = phase(Role::Responder, PairingMethod::PasskeyEntryInput);
        let mut init_out = Outbox { sent: Vec::new() };
        let mut resp_out = Outbox { sent: Vec::new() };
        let mut init_dl = None;
        let mut resp_dl = None;

        let passkey = match drive(&mut init_out, &mut init_dl, |s| init.start(s)).unwrap() {
            LegacyAction::DisplayPasskey(p) => p,
            other => panic!("unexpected: {:?}", other),
        };
        drive(&mut resp_out, &mut resp_dl, |s| resp.start(s)).unwrap();

        let mci = sent_confirm(&init_out, 0);
        drive(&mut resp_out, &mut resp_dl, |s| resp.on_confirm(mci, s)).unwrap();
        let wrong = (passkey + 1) % 1_000_000;
        drive(&mut resp_out, &mut resp_dl, |s| {
            resp.passkey_entered(wrong, s)
        })
        .unwrap();

        let sci = sent_confirm(&resp_out, 0);
        drive(&mut init_out, &mut init_dl, |s| init.on_confirm(sci, s)).unwrap();
        let mrand = sent_random(&init_out, 1);
        let err = drive(&mut resp_out, &mut resp_dl, |s| resp.on_random(mrand, s)).unwrap_err();
        assert_eq!(err, Error::Protocol(ErrorCode::ConfirmValueFailed));
    }

    #[test]
    fn short_key_size_masks_the_stk() {
        let mut init = LegacyPhase2::new(
            Role::Initiator,
            PairingMethod::JustWorks,
            7,
            PREQ,
            PRES,
            initiator_addr(),
            responder_addr(),
            None,
        );
        let mut resp = LegacyPhase2::new(
            Role::Responder,
            PairingMethod::JustWorks,
            7,
            PREQ,
            PRES,
            responder_addr(),
            initiator_addr(),
            None,
        );
        let mut init_out = Outbox { sent: Vec::new() };
        let mut resp_out = Outbox { sent: Vec::new() };
        let mut init_dl = None;
        let mut resp_dl = None;

        drive(&mut init_out, &mut init_dl, |s| init.start(s)).unwrap();
        drive(&mut resp_out, &mut resp_dl, |s| resp.start(s)).unwrap();
        let mci = sent_confirm(&init_out, 0);
        drive(&mut resp_out, &mut resp_dl, |s| resp.on_confirm(mci, s)).unwrap();
        let sci = sent_confirm(&resp_out, 0);
        drive(&mut init_out, &mut init_dl, |s| init.on_confirm(sci, s)).unwrap();
        let mrand = sent_random(&init_out, 1);
        let key = match drive(&mut resp_out, &mut resp_dl, |s| resp.on_random(mrand, s)) {
            Ok(LegacyAction::KeyReady(key)) => key,
            other => panic!("unexpected: {:?}", other),
        };
        assert_eq!(&key.value[..9], &[0u8; 9]);
    }

    #[test]
    fn out_of_band_without_data_is_unavailable() {
        let mut init = phase(Role::Initiator, PairingMethod::OutOfBand);
        let mut out = Outbox { sent: Vec::new() };
        let mut dl = None;
        let err = drive(&mut out, &mut dl, |s| init.start(s)).unwrap_err();
        assert_eq!(err, Error::Protocol(ErrorCode::OobNotAvailable));
    }
}
