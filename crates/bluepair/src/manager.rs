//! The Security Manager: one pairing engine per LE connection
//!
//! Single threaded and event driven. The host feeds in PDUs, encryption
//! changes and user responses; the engine walks the phases, drives the
//! channel and the link layer, and answers every security request exactly
//! once.

use crate::address::DeviceAddress;
use crate::channel::{LinkEncrypter, PairingChannel, PairingListener, PairingToken, PduSink};
use crate::crypto::{EcdhKeyPair, PublicKeyCoords};
use crate::error::{Error, ErrorCode, Result};
use crate::keys::{IdentityInfo, LinkKey, PairingData, PeerCache};
use crate::pdu::{
    Command, PairingDhKeyCheck, PairingFailed, PairingPublicKey, PairingRequest, SecurityRequest,
};
use crate::phases::legacy::{LegacyAction, LegacyPhase2};
use crate::phases::negotiate_features;
use crate::phases::phase3::Phase3;
use crate::phases::stage1::ScStage1;
use crate::phases::stage2::ScStage2;
use crate::types::{
    AuthRequirements, IoCapability, KeyDistribution, PairingFeatures, PairingMethod, Role,
    SecurityLevel, SecurityProperties,
};
use std::time::Instant;
use tracing::{debug, warn};

/// Local pairing policy
#[derive(Debug, Clone)]
pub struct PairingConfig {
    pub io_capability: IoCapability,
    pub secure_connections: bool,
    /// Whether keys may be stored. Without bonding on both sides nothing
    /// is committed to the peer cache.
    pub bondable: bool,
    pub max_encryption_key_size: u8,
    /// Keys to offer and to ask for; trimmed during negotiation
    pub requested_keys: KeyDistribution,
    /// Legacy OOB temporary key, when one was exchanged out of band
    pub oob_data: Option<[u8; 16]>,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            io_capability: IoCapability::NoInputNoOutput,
            secure_connections: true,
            bondable: true,
            max_encryption_key_size: 16,
            requested_keys: KeyDistribution::distributable(),
            oob_data: None,
        }
    }
}

type UpgradeCallback = Box<dyn FnOnce(Result<SecurityProperties>)>;

/// Everything Phase 2 and 3 need from the feature exchange
struct PairingContext {
    features: PairingFeatures,
    preq: [u8; 7],
    pres: [u8; 7],
}

impl PairingContext {
    /// 3-octet f6 IOcap field (AuthReq, OOB flag, IO capability).
    fn iocap(wire: &[u8; 7]) -> [u8; 3] {
        [wire[3], wire[2], wire[1]]
    }

    fn initiator_iocap(&self) -> [u8; 3] {
        Self::iocap(&self.preq)
    }

    fn responder_iocap(&self) -> [u8; 3] {
        Self::iocap(&self.pres)
    }
}

enum Phase {
    Idle,
    /// Initiator: Pairing Request sent, Response pending
    Phase1 { preq: [u8; 7] },
    Phase2Legacy {
        ctx: PairingContext,
        phase: LegacyPhase2,
    },
    /// Secure Connections public key exchange and Stage 1
    Phase2ScStage1 {
        ctx: PairingContext,
        ecdh: EcdhKeyPair,
        /// Set once the peer's valid public key is in
        dh_key: Option<[u8; 32]>,
        peer_pk: Option<PublicKeyCoords>,
        stage: Option<ScStage1>,
    },
    Phase2ScStage2 {
        ctx: PairingContext,
        stage: ScStage2,
        /// The numeric comparison / consent answer is still outstanding
        confirmed: bool,
        /// A DHKey check that arrived before the user answered
        pending_check: Option<PairingDhKeyCheck>,
    },
    /// Key in the controller's hands; LE-ENC event pending
    WaitingEncryption {
        /// `None` when encrypting with keys from an earlier bond
        pairing: Option<(PairingContext, Option<LinkKey>)>,
        security: SecurityProperties,
    },
    Phase3 {
        ctx: PairingContext,
        phase: Phase3,
    },
    Complete,
}

impl Phase {
    fn name(&self) -> &'static str {
        match self {
            Phase::Idle => "Idle",
            Phase::Phase1 { .. } => "Phase1",
            Phase::Phase2Legacy { .. } => "Phase2Legacy",
            Phase::Phase2ScStage1 { .. } => "Phase2ScStage1",
            Phase::Phase2ScStage2 { .. } => "Phase2ScStage2",
            Phase::WaitingEncryption { .. } => "WaitingEncryption",
            Phase::Phase3 { .. } => "Phase3",
            Phase::Complete => "Complete",
        }
    }
}

/// The per-connection Security Manager
pub struct SecurityManager {
    role: Role,
    local_addr: DeviceAddress,
    peer_addr: DeviceAddress,
    config: PairingConfig,
    channel: Box<dyn PairingChannel>,
    encrypter: Box<dyn LinkEncrypter>,
    listener: Box<dyn PairingListener>,
    cache: Box<dyn PeerCache>,
    phase: Phase,
    /// Bumped on every abort, reset and completion; stale user-response
    /// tokens are ignored
    epoch: u64,
    deadline: Option<Instant>,
    current_security: SecurityProperties,
    pending: Vec<(SecurityLevel, UpgradeCallback)>,
    /// A Security Request is on the wire and unanswered; coalesced
    /// upgrades must not send another
    security_requested: bool,
    /// Set after a pairing timeout or channel loss; the link is unusable
    /// for SMP until reconnection
    link_dead: bool,
}

impl SecurityManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        role: Role,
        local_addr: DeviceAddress,
        peer_addr: DeviceAddress,
        config: PairingConfig,
        channel: Box<dyn PairingChannel>,
        encrypter: Box<dyn LinkEncrypter>,
        listener: Box<dyn PairingListener>,
        cache: Box<dyn PeerCache>,
    ) -> Self {
        Self {
            role,
            local_addr,
            peer_addr,
            config,
            channel,
            encrypter,
            listener,
            cache,
            phase: Phase::Idle,
            epoch: 0,
            deadline: None,
            current_security: SecurityProperties::insecure(),
            pending: Vec::new(),
            security_requested: false,
            link_dead: false,
        }
    }

    pub fn current_security(&self) -> SecurityProperties {
        self.current_security
    }

    fn token(&self) -> PairingToken {
        PairingToken { epoch: self.epoch }
    }

    fn token_is_stale(&self, token: PairingToken) -> bool {
        token.epoch != self.epoch
    }

    /// Bring the link to at least `level`, pairing if necessary. The
    /// callback fires exactly once, when the request is resolved either
    /// way. Concurrent requests coalesce onto the pairing in flight.
    pub fn upgrade_security(
        &mut self,
        level: SecurityLevel,
        now: Instant,
        callback: impl FnOnce(Result<SecurityProperties>) + 'static,
    ) {
        if self.link_dead {
            callback(Err(Error::ChannelClosed));
            return;
        }
        if self.current_security.satisfies(level) {
            callback(Ok(self.current_security));
            return;
        }
        let idle = matches!(self.phase, Phase::Idle);
        self.pending.push((level, Box::new(callback)));
        if !idle {
            debug!(level = ?level, "security request joins pairing in flight");
            return;
        }

        // Keys from an earlier bond may already be good enough.
        if let Some(bond) = self.cache.existing_bond(&self.peer_addr) {
            let usable = match self.role {
                Role::Initiator => bond.peer_ltk,
                Role::Responder => bond.local_ltk,
            };
            if let Some(ltk) = usable {
                if ltk.security.satisfies(level) {
                    debug!("encrypting with stored bond keys");
                    match self.role {
                        Role::Initiator => self.encrypter.start_encryption(ltk.key()),
                        Role::Responder => {
                            // The peripheral cannot start encryption itself;
                            // a Security Request prompts the central to.
                            self.encrypter.assign_long_term_key(ltk.key());
                            let auth = self.local_auth_req(level);
                            let mut sink =
                                PduSink::new(&mut *self.channel, &mut self.deadline, now);
                            sink.send(SecurityRequest::new(auth).serialize());
                        }
                    }
                    self.phase = Phase::WaitingEncryption {
                        pairing: None,
                        security: ltk.security,
                    };
                    return;
                }
            }
        }

        match self.role {
            Role::Initiator => self.begin_pairing(level, now),
            Role::Responder => {
                if self.security_requested {
                    debug!("security request already outstanding");
                    return;
                }
                let auth = self.local_auth_req(level);
                let mut sink = PduSink::new(&mut *self.channel, &mut self.deadline, now);
                sink.send(SecurityRequest::new(auth).serialize());
                self.security_requested = true;
            }
        }
    }

    fn pending_level(&self) -> SecurityLevel {
        self.pending
            .iter()
            .map(|(level, _)| *level)
            .max()
            .unwrap_or(SecurityLevel::EncryptionOnly)
    }

    fn local_auth_req(&self, level: SecurityLevel) -> AuthRequirements {
        let mut auth = AuthRequirements::new(
            self.config.bondable,
            level >= SecurityLevel::EncryptionWithAuthentication,
            self.config.secure_connections,
        );
        // MITM costs nothing when the IO can deliver it.
        if self.config.io_capability != IoCapability::NoInputNoOutput {
            auth.mitm = true;
        }
        auth
    }

    fn local_pairing_request(&mut self, level: SecurityLevel) -> PairingRequest {
        let offered = self.offered_keys();
        PairingRequest::new(
            self.config.io_capability,
            self.config.oob_data.is_some(),
            self.local_auth_req(level),
            self.config.max_encryption_key_size,
            match self.role {
                Role::Initiator => offered,
                Role::Responder => self.config.requested_keys,
            },
            match self.role {
                Role::Initiator => self.config.requested_keys,
                Role::Responder => offered,
            },
        )
    }

    /// Keys this side can actually deliver.
    fn offered_keys(&mut self) -> KeyDistribution {
        let mut keys = self.config.requested_keys.distributable_subset();
        if self.listener.identity_info().is_none() {
            keys.remove(KeyDistribution::ID_KEY);
        }
        keys
    }

    fn begin_pairing(&mut self, level: SecurityLevel, now: Instant) {
        let request = self.local_pairing_request(level);
        let preq = request.wire_bytes(true);
        debug!(peer = %self.peer_addr.bd_addr, "initiating pairing");
        let mut sink = PduSink::new(&mut *self.channel, &mut self.deadline, now);
        sink.send(request.serialize(true));
        self.phase = Phase::Phase1 { preq };
    }

    /// Feed one inbound SMP PDU.
    pub fn on_pdu(&mut self, pdu: &[u8], now: Instant) {
        if self.link_dead {
            return;
        }
        if let Err(err) = self.handle_pdu(pdu, now) {
            self.fail_pairing(err, now);
        }
    }

    fn handle_pdu(&mut self, pdu: &[u8], now: Instant) -> Result<()> {
        let command = Command::parse(pdu)?;
        match command {
            Command::PairingFailed(failed) => {
                warn!(reason = %failed.reason, "peer failed the pairing");
                if !matches!(self.phase, Phase::Idle | Phase::Complete) || !self.pending.is_empty()
                {
                    self.reset_pairing(Error::PeerRejected(failed.reason));
                }
                Ok(())
            }
            Command::SecurityRequest(request) => self.on_security_request(request, now),
            Command::PairingRequest(request) => self.on_pairing_request(request, pdu, now),
            Command::PairingResponse(response) => self.on_pairing_response(response, pdu, now),
            Command::KeypressNotification(_) => Ok(()),
            Command::SigningInformation(_) => {
                // CSRK distribution is never negotiated by this engine.
                Err(Error::Protocol(ErrorCode::UnspecifiedReason))
            }
            other => self.on_phase_pdu(other, now),
        }
    }

    fn on_security_request(&mut self, request: SecurityRequest, now: Instant) -> Result<()> {
        if self.role != Role::Initiator {
            return Err(Error::Protocol(ErrorCode::CommandNotSupported));
        }
        if !matches!(self.phase, Phase::Idle) {
            // Already pairing or encrypting; the request is satisfied by
            // whatever is in flight.
            return Ok(());
        }
        let level = if request.auth_req.mitm {
            SecurityLevel::EncryptionWithAuthentication
        } else {
            SecurityLevel::EncryptionOnly
        };
        if self.current_security.satisfies(level) {
            return Ok(());
        }
        debug!(?level, "peer requested security");
        if let Some(bond) = self.cache.existing_bond(&self.peer_addr) {
            if let Some(ltk) = bond.peer_ltk {
                if ltk.security.satisfies(level) {
                    self.encrypter.start_encryption(ltk.key());
                    self.phase = Phase::WaitingEncryption {
                        pairing: None,
                        security: ltk.security,
                    };
                    return Ok(());
                }
            }
        }
        self.begin_pairing(level.max(self.pending_level()), now);
        Ok(())
    }

    fn on_pairing_request(
        &mut self,
        request: PairingRequest,
        pdu: &[u8],
        now: Instant,
    ) -> Result<()> {
        if self.role != Role::Responder {
            return Err(Error::Protocol(ErrorCode::CommandNotSupported));
        }
        if !matches!(self.phase, Phase::Idle) {
            return Err(Error::Protocol(ErrorCode::UnspecifiedReason));
        }
        let mut preq = [0u8; 7];
        preq.copy_from_slice(&pdu[..7]);
        self.security_requested = false;

        let mut response = self.local_pairing_request(self.pending_level());
        // The response may only trim what the initiator put on the table.
        response.initiator_key_dist &= request.initiator_key_dist;
        response.responder_key_dist &= request.responder_key_dist;
        response.oob_data_present &= request.oob_data_present;

        let features = negotiate_features(Role::Responder, &request, &response)
            .map_err(Error::Protocol)?;
        let pres = response.wire_bytes(false);
        let mut sink = PduSink::new(&mut *self.channel, &mut self.deadline, now);
        sink.send(response.serialize(false));
        debug!(method = %features.method, sc = features.secure_connections, "pairing features agreed");
        self.enter_phase2(PairingContext { features, preq, pres }, now)
    }

    fn on_pairing_response(
        &mut self,
        response: PairingRequest,
        pdu: &[u8],
        now: Instant,
    ) -> Result<()> {
        let Phase::Phase1 { preq } = &self.phase else {
            return Err(Error::Protocol(ErrorCode::UnspecifiedReason));
        };
        let preq = *preq;
        if self.role != Role::Initiator {
            return Err(Error::Protocol(ErrorCode::CommandNotSupported));
        }
        let request = PairingRequest::parse(&preq)?;
        let features =
            negotiate_features(Role::Initiator, &request, &response).map_err(Error::Protocol)?;
        let mut pres = [0u8; 7];
        pres.copy_from_slice(&pdu[..7]);
        debug!(method = %features.method, sc = features.secure_connections, "pairing features agreed");
        self.enter_phase2(PairingContext { features, preq, pres }, now)
    }

    fn enter_phase2(&mut self, ctx: PairingContext, now: Instant) -> Result<()> {
        if ctx.features.secure_connections {
            let ecdh = EcdhKeyPair::generate();
            let public = ecdh.public();
            self.phase = Phase::Phase2ScStage1 {
                ctx,
                ecdh,
                dh_key: None,
                peer_pk: None,
                stage: None,
            };
            if self.role == Role::Initiator {
                let mut sink = PduSink::new(&mut *self.channel, &mut self.deadline, now);
                sink.send(PairingPublicKey::new(public.x, public.y).serialize());
            }
            Ok(())
        } else {
            let mut phase = LegacyPhase2::new(
                self.role,
                ctx.features.method,
                ctx.features.encryption_key_size,
                ctx.preq,
                ctx.pres,
                self.local_addr,
                self.peer_addr,
                self.config.oob_data,
            );
            let mut sink = PduSink::new(&mut *self.channel, &mut self.deadline, now);
            let action = phase.start(&mut sink)?;
            self.phase = Phase::Phase2Legacy { ctx, phase };
            self.perform_legacy_action(action);
            Ok(())
        }
    }

    fn perform_legacy_action(&mut self, action: LegacyAction) {
        match action {
            LegacyAction::None => {}
            LegacyAction::DisplayPasskey(passkey) => {
                let token = self.token();
                self.listener.display_passkey(token, passkey);
            }
            LegacyAction::RequestPasskey => {
                let token = self.token();
                self.listener.request_passkey(token);
            }
            LegacyAction::KeyReady(stk) => {
                debug!("legacy phase 2 complete, encrypting with STK");
                match self.role {
                    Role::Initiator => self.encrypter.start_encryption(&stk),
                    Role::Responder => self.encrypter.assign_long_term_key(&stk),
                }
                let Phase::Phase2Legacy { ctx, .. } =
                    std::mem::replace(&mut self.phase, Phase::Idle)
                else {
                    unreachable!("legacy action outside legacy phase");
                };
                let security = ctx.features.security_properties();
                self.phase = Phase::WaitingEncryption {
                    pairing: Some((ctx, None)),
                    security,
                };
            }
        }
    }

    fn on_phase_pdu(&mut self, command: Command, now: Instant) -> Result<()> {
        let mut phase = std::mem::replace(&mut self.phase, Phase::Idle);
        let result = self.dispatch_phase_pdu(&mut phase, command, now);
        self.phase = phase;
        match result {
            Ok(next) => {
                if let Some(next) = next {
                    self.apply_transition(next, now)?;
                }
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn dispatch_phase_pdu(
        &mut self,
        phase: &mut Phase,
        command: Command,
        now: Instant,
    ) -> Result<Option<Transition>> {
        let mut sink = PduSink::new(&mut *self.channel, &mut self.deadline, now);
        match (phase, command) {
            (Phase::Phase2Legacy { phase, .. }, Command::PairingConfirm(confirm)) => {
                let action = phase.on_confirm(confirm, &mut sink)?;
                Ok(Some(Transition::Legacy(action)))
            }
            (Phase::Phase2Legacy { phase, .. }, Command::PairingRandom(random)) => {
                let action = phase.on_random(random, &mut sink)?;
                Ok(Some(Transition::Legacy(action)))
            }
            (
                Phase::Phase2ScStage1 {
                    ctx,
                    ecdh,
                    dh_key,
                    peer_pk,
                    stage,
                },
                Command::PairingPublicKey(pk),
            ) => {
                if peer_pk.is_some() {
                    return Err(Error::Protocol(ErrorCode::UnspecifiedReason));
                }
                let coords = PublicKeyCoords { x: pk.x, y: pk.y };
                // Off-curve and reflected keys both end the exchange.
                if coords == ecdh.public() {
                    return Err(Error::Protocol(ErrorCode::InvalidParameters));
                }
                let Some(shared) = ecdh.dh_key(&coords) else {
                    return Err(Error::Protocol(ErrorCode::InvalidParameters));
                };
                if self.role == Role::Responder {
                    let public = ecdh.public();
                    sink.send(PairingPublicKey::new(public.x, public.y).serialize());
                }
                *peer_pk = Some(coords);
                *dh_key = Some(shared);
                let mut s1 = ScStage1::new(
                    self.role,
                    ctx.features.method,
                    ecdh.public().x,
                    coords.x,
                )?;
                s1.start(&mut sink)?;
                *stage = Some(s1);
                Ok(None)
            }
            (Phase::Phase2ScStage1 { stage, .. }, Command::PairingConfirm(confirm)) => {
                let stage = stage
                    .as_mut()
                    .ok_or(Error::Protocol(ErrorCode::UnspecifiedReason))?;
                match stage.on_confirm(confirm, &mut sink)? {
                    Some(output) => Ok(Some(Transition::Stage1Done(output))),
                    None => Ok(None),
                }
            }
            (Phase::Phase2ScStage1 { stage, .. }, Command::PairingRandom(random)) => {
                let stage = stage
                    .as_mut()
                    .ok_or(Error::Protocol(ErrorCode::UnspecifiedReason))?;
                match stage.on_random(random, &mut sink)? {
                    Some(output) => Ok(Some(Transition::Stage1Done(output))),
                    None => Ok(None),
                }
            }
            (
                Phase::Phase2ScStage2 {
                    stage,
                    confirmed,
                    pending_check,
                    ..
                },
                Command::PairingDhKeyCheck(check),
            ) => {
                if !*confirmed {
                    // Only the responder may see a check before the user
                    // answers; the responder itself must hold Eb until Ea.
                    if self.role == Role::Initiator || pending_check.is_some() {
                        return Err(Error::Protocol(ErrorCode::UnspecifiedReason));
                    }
                    *pending_check = Some(check);
                    return Ok(None);
                }
                match stage.on_dhkey_check(check, &mut sink)? {
                    Some(ltk) => Ok(Some(Transition::Stage2Done(ltk))),
                    None => Ok(None),
                }
            }
            (Phase::Phase3 { phase, .. }, command) => {
                let data = match command {
                    Command::EncryptionInformation(info) => phase.on_encryption_information(info)?,
                    Command::MasterIdentification(ident) => {
                        phase.on_master_identification(ident, &mut sink)?
                    }
                    Command::IdentityInformation(info) => phase.on_identity_information(info)?,
                    Command::IdentityAddressInformation(info) => {
                        phase.on_identity_address(info, &mut sink)?
                    }
                    _ => return Err(Error::Protocol(ErrorCode::UnspecifiedReason)),
                };
                Ok(data.map(Transition::Phase3Done))
            }
            _ => Err(Error::Protocol(ErrorCode::UnspecifiedReason)),
        }
    }

    fn apply_transition(&mut self, transition: Transition, now: Instant) -> Result<()> {
        match transition {
            Transition::Legacy(action) => {
                self.perform_legacy_action(action);
                Ok(())
            }
            Transition::Stage1Done(output) => {
                let Phase::Phase2ScStage1 { ctx, dh_key, .. } =
                    std::mem::replace(&mut self.phase, Phase::Idle)
                else {
                    unreachable!("stage 1 output outside stage 1");
                };
                let dh_key = dh_key.ok_or(Error::InvalidState)?;
                let (local_iocap, peer_iocap) = match self.role {
                    Role::Initiator => (ctx.initiator_iocap(), ctx.responder_iocap()),
                    Role::Responder => (ctx.responder_iocap(), ctx.initiator_iocap()),
                };
                let stage = ScStage2::new(
                    self.role,
                    ctx.features.encryption_key_size,
                    &dh_key,
                    &output,
                    &self.local_addr,
                    &self.peer_addr,
                    local_iocap,
                    peer_iocap,
                )?;
                let token = self.token();
                self.listener
                    .confirm_pairing(token, output.comparison_value);
                self.phase = Phase::Phase2ScStage2 {
                    ctx,
                    stage,
                    confirmed: false,
                    pending_check: None,
                };
                Ok(())
            }
            Transition::Stage2Done(ltk) => {
                let Phase::Phase2ScStage2 { ctx, .. } =
                    std::mem::replace(&mut self.phase, Phase::Idle)
                else {
                    unreachable!("stage 2 output outside stage 2");
                };
                debug!("DHKey checks complete, encrypting with LTK");
                match self.role {
                    Role::Initiator => self.encrypter.start_encryption(&ltk),
                    Role::Responder => self.encrypter.assign_long_term_key(&ltk),
                }
                let security = ctx.features.security_properties();
                self.phase = Phase::WaitingEncryption {
                    pairing: Some((ctx, Some(ltk))),
                    security,
                };
                Ok(())
            }
            Transition::Phase3Done(data) => {
                let _ = now;
                self.complete_pairing(data);
                Ok(())
            }
        }
    }

    /// The controller reported a change in link encryption.
    pub fn on_encryption_changed(&mut self, encrypted: bool, now: Instant) {
        if self.link_dead {
            return;
        }
        if !encrypted {
            self.current_security = SecurityProperties::insecure();
            if matches!(self.phase, Phase::WaitingEncryption { .. }) {
                self.fail_pairing(Error::EncryptionFailed, now);
            }
            return;
        }
        let Phase::WaitingEncryption { pairing, security } =
            std::mem::replace(&mut self.phase, Phase::Idle)
        else {
            // Encryption established outside an SMP exchange (e.g. the
            // central used stored keys without telling us first).
            return;
        };
        self.current_security = security;
        match pairing {
            None => {
                debug!(security = %security, "link encrypted with bonded keys");
                self.listener.on_security_changed(security);
                self.resolve_pending();
            }
            Some((ctx, sc_ltk)) => {
                let local_identity = self.local_identity_for(&ctx.features);
                let mut phase = Phase3::new(
                    self.role,
                    ctx.features.clone(),
                    security,
                    local_identity,
                    sc_ltk,
                );
                let mut sink = PduSink::new(&mut *self.channel, &mut self.deadline, now);
                match phase.start(&mut sink) {
                    Ok(Some(data)) => {
                        self.phase = Phase::Phase3 { ctx, phase };
                        self.complete_pairing(data);
                    }
                    Ok(None) => {
                        self.phase = Phase::Phase3 { ctx, phase };
                    }
                    Err(err) => {
                        self.phase = Phase::Phase3 { ctx, phase };
                        self.fail_pairing(err, now);
                    }
                }
            }
        }
    }

    fn local_identity_for(&mut self, features: &PairingFeatures) -> Option<IdentityInfo> {
        if features
            .local_key_distribution
            .contains(KeyDistribution::ID_KEY)
        {
            self.listener.identity_info()
        } else {
            None
        }
    }

    fn complete_pairing(&mut self, data: PairingData) {
        let Phase::Phase3 { ctx, .. } = std::mem::replace(&mut self.phase, Phase::Complete) else {
            unreachable!("completion outside phase 3");
        };
        let security = ctx.features.security_properties();
        debug!(security = %security, bonded = ctx.features.will_bond, "pairing complete");
        if ctx.features.will_bond {
            if let (Some(irk), Some(identity)) = (data.irk, data.identity_address) {
                self.cache.register_identity(self.peer_addr, irk, identity);
            }
            self.cache.commit_bond(self.peer_addr, &data);
        }
        self.deadline = None;
        self.epoch += 1;
        self.current_security = security;
        self.listener.on_security_changed(security);
        self.resolve_pending();
    }

    fn resolve_pending(&mut self) {
        let achieved = self.current_security;
        for (level, callback) in self.pending.drain(..) {
            if achieved.satisfies(level) {
                callback(Ok(achieved));
            } else {
                callback(Err(Error::Protocol(ErrorCode::AuthenticationRequirements)));
            }
        }
    }

    /// The user's answer to a pairing consent or numeric comparison prompt.
    pub fn confirm(&mut self, token: PairingToken, accepted: bool, now: Instant) {
        if self.token_is_stale(token) {
            return;
        }
        let Phase::Phase2ScStage2 {
            confirmed,
            pending_check,
            ctx,
            ..
        } = &mut self.phase
        else {
            return;
        };
        // The prompt is answered once; later calls for the same token no-op.
        if *confirmed {
            return;
        }
        if !accepted {
            let reason = match ctx.features.method {
                PairingMethod::NumericComparison => ErrorCode::NumericComparisonFailed,
                _ => ErrorCode::UnspecifiedReason,
            };
            self.fail_pairing(Error::Protocol(reason), now);
            return;
        }
        *confirmed = true;
        let queued = pending_check.take();
        if self.role == Role::Initiator {
            let Phase::Phase2ScStage2 { stage, .. } = &mut self.phase else {
                unreachable!();
            };
            let mut sink = PduSink::new(&mut *self.channel, &mut self.deadline, now);
            stage.start(&mut sink);
        } else if let Some(check) = queued {
            if let Err(err) = self.on_phase_pdu(Command::PairingDhKeyCheck(check), now) {
                self.fail_pairing(err, now);
            }
        }
    }

    /// The user's answer to a passkey request. `None` cancels.
    pub fn provide_passkey(&mut self, token: PairingToken, passkey: Option<u32>, now: Instant) {
        if self.token_is_stale(token) {
            return;
        }
        if !matches!(self.phase, Phase::Phase2Legacy { .. }) {
            return;
        }
        let Some(passkey) = passkey else {
            self.fail_pairing(Error::Protocol(ErrorCode::PasskeyEntryFailed), now);
            return;
        };
        let mut phase = std::mem::replace(&mut self.phase, Phase::Idle);
        let result = {
            let Phase::Phase2Legacy { phase, .. } = &mut phase else {
                unreachable!();
            };
            let mut sink = PduSink::new(&mut *self.channel, &mut self.deadline, now);
            phase.passkey_entered(passkey % 1_000_000, &mut sink)
        };
        self.phase = phase;
        match result {
            Ok(action) => self.perform_legacy_action(action),
            Err(err) => self.fail_pairing(err, now),
        }
    }

    /// Abort any pairing in flight. Idempotent.
    pub fn abort(&mut self, now: Instant) {
        if matches!(self.phase, Phase::Idle | Phase::Complete) {
            return;
        }
        let mut sink = PduSink::new(&mut *self.channel, &mut self.deadline, now);
        sink.send(PairingFailed::new(ErrorCode::UnspecifiedReason).serialize());
        self.reset_pairing(Error::Canceled);
    }

    /// Check the pairing timer. Call with a monotonic now; on expiry the
    /// attempt fails and the link is torn down.
    pub fn poll_timeout(&mut self, now: Instant) {
        let expired = self.deadline.map(|dl| now >= dl).unwrap_or(false);
        if !expired {
            return;
        }
        warn!("pairing timed out");
        self.deadline = None;
        self.link_dead = true;
        self.reset_pairing(Error::TimedOut);
        self.encrypter.disconnect();
    }

    /// The L2CAP channel went away.
    pub fn on_channel_closed(&mut self) {
        self.link_dead = true;
        self.reset_pairing(Error::ChannelClosed);
    }

    fn fail_pairing(&mut self, err: Error, now: Instant) {
        let reason = match &err {
            Error::Protocol(code) => Some(*code),
            Error::Malformed(detail) => {
                warn!(detail, "malformed PDU");
                Some(ErrorCode::InvalidParameters)
            }
            _ => None,
        };
        if let Some(reason) = reason {
            let mut sink = PduSink::new(&mut *self.channel, &mut self.deadline, now);
            sink.send(PairingFailed::new(reason).serialize());
        }
        if matches!(self.phase, Phase::Idle | Phase::Complete) && self.pending.is_empty() {
            // A stray bad PDU outside pairing gets the failure response
            // above and nothing else.
            self.deadline = None;
            return;
        }
        self.reset_pairing(err);
    }

    fn reset_pairing(&mut self, err: Error) {
        debug!(from = self.phase.name(), "pairing reset");
        self.phase = Phase::Idle;
        self.deadline = None;
        self.epoch += 1;
        self.security_requested = false;
        for (_, callback) in self.pending.drain(..) {
            callback(Err(err));
        }
    }
}

enum Transition {
    Legacy(LegacyAction),
    Stage1Done(crate::phases::stage1::Stage1Output),
    Stage2Done(LinkKey),
    Phase3Done(PairingData),
}
