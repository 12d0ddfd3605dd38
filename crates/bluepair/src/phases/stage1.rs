//! Secure Connections Phase 2, Stage 1: authentication after the public
//! key exchange
//!
//! Just Works and Numeric Comparison share one ladder: the responder
//! commits to its nonce with `f4` before either nonce is revealed, the
//! initiator discloses first, and the initiator checks the commitment.
//! Numeric Comparison additionally derives the 6-digit `g2` value both
//! users compare.

use crate::channel::PduSink;
use crate::crypto;
use crate::error::{Error, ErrorCode, Result};
use crate::pdu::{PairingConfirm, PairingRandom};
use crate::types::{PairingMethod, Role};

/// Nonces and r-values Stage 2 needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage1Output {
    pub initiator_rand: [u8; 16],
    pub responder_rand: [u8; 16],
    /// f6 r inputs; all zero for Just Works and Numeric Comparison
    pub initiator_r: [u8; 16],
    pub responder_r: [u8; 16],
    /// The number to put in front of the user, for Numeric Comparison
    pub comparison_value: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    /// Responder: commitment sent, waiting for the initiator's nonce
    SentConfirm,
    /// Initiator: waiting for the responder's commitment
    AwaitingConfirm,
    /// Initiator: nonce sent, waiting for the responder's
    AwaitingRandom,
    Complete,
}

/// Stage 1 state machine for the numeric methods
pub struct ScStage1 {
    role: Role,
    method: PairingMethod,
    /// X coordinates of both public keys, big-endian
    local_pk_x: [u8; 32],
    peer_pk_x: [u8; 32],
    local_rand: [u8; 16],
    peer_confirm: Option<[u8; 16]>,
    state: State,
}

impl ScStage1 {
    pub fn new(
        role: Role,
        method: PairingMethod,
        local_pk_x: [u8; 32],
        peer_pk_x: [u8; 32],
    ) -> Result<Self> {
        if !matches!(
            method,
            PairingMethod::JustWorks | PairingMethod::NumericComparison
        ) {
            return Err(Error::Protocol(ErrorCode::AuthenticationRequirements));
        }
        Ok(Self {
            role,
            method,
            local_pk_x,
            peer_pk_x,
            local_rand: crypto::random_128(),
            peer_confirm: None,
            state: State::Idle,
        })
    }

    /// Begin after both public keys are known. The responder opens with
    /// its commitment.
    pub fn start(&mut self, sink: &mut PduSink<'_>) -> Result<()> {
        if self.state != State::Idle {
            return Err(Error::InvalidState);
        }
        match self.role {
            Role::Responder => {
                let confirm = crypto::f4(&self.local_pk_x, &self.peer_pk_x, &self.local_rand, 0);
                sink.send(PairingConfirm::new(confirm).serialize());
                self.state = State::SentConfirm;
            }
            Role::Initiator => {
                self.state = State::AwaitingConfirm;
            }
        }
        Ok(())
    }

    pub fn on_confirm(
        &mut self,
        confirm: PairingConfirm,
        sink: &mut PduSink<'_>,
    ) -> Result<Option<Stage1Output>> {
        if self.role != Role::Initiator || self.state != State::AwaitingConfirm {
            return Err(Error::Protocol(ErrorCode::UnspecifiedReason));
        }
        self.peer_confirm = Some(confirm.value);
        sink.send(PairingRandom::new(self.local_rand).serialize());
        self.state = State::AwaitingRandom;
        Ok(None)
    }

    pub fn on_random(
        &mut self,
        random: PairingRandom,
        sink: &mut PduSink<'_>,
    ) -> Result<Option<Stage1Output>> {
        match (self.role, self.state) {
            (Role::Initiator, State::AwaitingRandom) => {
                let expected = self
                    .peer_confirm
                    .ok_or(Error::Protocol(ErrorCode::UnspecifiedReason))?;
                // The responder's nonce must open its commitment.
                let check = crypto::f4(&self.peer_pk_x, &self.local_pk_x, &random.value, 0);
                if check != expected {
                    return Err(Error::Protocol(ErrorCode::ConfirmValueFailed));
                }
                self.state = State::Complete;
                Ok(Some(self.output(self.local_rand, random.value)))
            }
            (Role::Responder, State::SentConfirm) => {
                sink.send(PairingRandom::new(self.local_rand).serialize());
                self.state = State::Complete;
                Ok(Some(self.output(random.value, self.local_rand)))
            }
            _ => Err(Error::Protocol(ErrorCode::UnspecifiedReason)),
        }
    }

    fn output(&self, initiator_rand: [u8; 16], responder_rand: [u8; 16]) -> Stage1Output {
        let comparison_value = match self.method {
            PairingMethod::NumericComparison => {
                let (pka, pkb) = match self.role {
                    Role::Initiator => (&self.local_pk_x, &self.peer_pk_x),
                    Role::Responder => (&self.peer_pk_x, &self.local_pk_x),
                };
                Some(crypto::g2(pka, pkb, &initiator_rand, &responder_rand) % 1_000_000)
            }
            _ => None,
        };
        Stage1Output {
            initiator_rand,
            responder_rand,
            initiator_r: [0; 16],
            responder_r: [0; 16],
            comparison_value,
        }
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

    fn pk(byte: u8) -> [u8; 32] {
        [byte; 32]
    }

    fn run<T>(
        outbox: &mut Outbox,
        deadline: &mut Option<Instant>,
        f: impl FnOnce(&mut PduSink<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut sink = PduSink::new(outbox, deadline, Instant::now());
        f(&mut sink)
    }

    fn sent(outbox: &Outbox, index: usize) -> Command {
        Command::parse(&outbox.sent[index]).unwrap()
    }

    fn exchange(method: PairingMethod) -> (Stage1Output, Stage1Output) {
        let mut init = ScStage1::new(Role::Initiator, method, pk(0x11), pk(0x22)).unwrap();
        let mut resp = ScStage1::new(Role::Responder, method, pk(0x22), pk(0x11)).unwrap();
        let mut init_out = Outbox { sent: Vec::new() };
        let mut resp_out = Outbox { sent: Vec::new() };
        let mut init_dl = None;
        let mut resp_dl = None;

        run(&mut init_out, &mut init_dl, |s| init.start(s)).unwrap();
        run(&mut resp_out, &mut resp_dl, |s| resp.start(s)).unwrap();

        let cb = match sent(&resp_out, 0) {
            Command::PairingConfirm(c) => c,
            other => panic!("expected confirm, got {:?}", other),
        };
        assert!(run(&mut init_out, &mut init_dl, |s| init.on_confirm(cb, s))
            .unwrap()
            .is_none());
        let na = match sent(&init_out, 0) {
            Command::PairingRandom(r) => r,
            other => panic!("expected random, got {:?}", other),
        };
        let resp_done = run(&mut resp_out, &mut resp_dl, |s| resp.on_random(na, s))
            .unwrap()
            .unwrap();
        let nb = match sent(&resp_out, 1) {
            Command::PairingRandom(r) => r,
            other => panic!("expected random, got {:?}", other),
        };
        let init_done = run(&mut init_out, &mut init_dl, |s| init.on_random(nb, s))
            .unwrap()
            .unwrap();
        (init_done, resp_done)
    }

    #[test]
    fn just_works_agrees_on_nonces() {
        let (init_done, resp_done) = exchange(PairingMethod::JustWorks);
        assert_eq!(init_done, resp_done);
        assert_eq!(init_done.comparison_value, None);
        assert_eq!(init_done.initiator_r, [0; 16]);
        assert_eq!(init_done.responder_r, [0; 16]);
    }

    #[test]
    fn numeric_comparison_shows_the_same_six_digits() {
        let (init_done, resp_done) = exchange(PairingMethod::NumericComparison);
        assert_eq!(init_done.comparison_value, resp_done.comparison_value);
        assert!(init_done.comparison_value.unwrap() < 1_000_000);
    }

    #[test]
    fn tampered_commitment_is_caught() {
        let mut init =
            ScStage1::new(Role::Initiator, PairingMethod::JustWorks, pk(0x11), pk(0x22)).unwrap();
        let mut out = Outbox { sent: Vec::new() };
        let mut dl = None;
        run(&mut out, &mut dl, |s| init.start(s)).unwrap();
        run(&mut out, &mut dl, |s| {
            init.on_confirm(PairingConfirm::new([0xEE; 16]), s)
        })
        .unwrap();
        let err = run(&mut out, &mut dl, |s| {
            init.on_random(PairingRandom::new([0x33; 16]), s)
        })
        .unwrap_err();
        assert_eq!(err, Error::Protocol(ErrorCode::ConfirmValueFailed));
    }

    #[test]
    fn passkey_methods_are_not_negotiable_here() {
        assert!(ScStage1::new(
            Role::Initiator,
            PairingMethod::PasskeyEntryInput,
            pk(0x11),
            pk(0x22)
        )
        .is_err());
    }

    #[test]
    fn nonce_before_commitment_is_rejected() {
        let mut init =
            ScStage1::new(Role::Initiator, PairingMethod::JustWorks, pk(0x11), pk(0x22)).unwrap();
        let mut out = Outbox { sent: Vec::new() };
        let mut dl = None;
        run(&mut out, &mut dl, |s| init.start(s)).unwrap();
        let err = run(&mut out, &mut dl, |s| {
            init.on_random(PairingRandom::new([0x33; 16]), s)
        })
        .unwrap_err();
        assert_eq!(err, Error::Protocol(ErrorCode::UnspecifiedReason));
    }
}
