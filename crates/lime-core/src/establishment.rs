//! Session establishment orchestration.
//!
//! [`establish_client`] and [`establish_server`] drive the full handshake
//! over the role channels: negotiation (skipped when there is nothing to
//! negotiate), authentication round-trips and the final `Established`
//! announcement. Policy lives in the callback traits; the orchestrators
//! own only the protocol sequencing.

use async_trait::async_trait;

use lime_proto::reason::codes;
use lime_proto::{
    Authentication, AuthenticationScheme, DomainRole, Identity, Node, Reason, Session,
    SessionCompression, SessionEncryption, SessionState,
};

use crate::client::ClientChannel;
use crate::error::ChannelError;
use crate::server::ServerChannel;

/// Client-side credential supplier.
///
/// Called once per authentication round-trip: the first call receives the
/// server's scheme offer and no round-trip payload; subsequent calls carry
/// the server's challenge.
#[async_trait]
pub trait ClientAuthenticator: Send + Sync {
    /// Produce credentials for one authentication round-trip.
    async fn authenticate(
        &self,
        schemes: &[AuthenticationScheme],
        round_trip: Option<Authentication>,
    ) -> Result<Authentication, ChannelError>;
}

/// Authenticates as an anonymous guest.
#[derive(Clone, Copy, Debug, Default)]
pub struct GuestAuthenticator;

#[async_trait]
impl ClientAuthenticator for GuestAuthenticator {
    async fn authenticate(
        &self,
        schemes: &[AuthenticationScheme],
        _round_trip: Option<Authentication>,
    ) -> Result<Authentication, ChannelError> {
        if schemes.contains(&AuthenticationScheme::Guest) {
            Ok(Authentication::Guest)
        } else {
            Err(ChannelError::InvalidOptions("guest scheme not offered"))
        }
    }
}

/// The client's establishment recipe.
pub struct ClientEstablishment {
    /// Identity to authenticate as.
    pub identity: Identity,
    /// Requested instance name; the server may override it.
    pub instance: Option<String>,
    /// Picks one compression from the server's offer.
    pub compression_selector: fn(&[SessionCompression]) -> Option<SessionCompression>,
    /// Picks one encryption from the server's offer.
    pub encryption_selector: fn(&[SessionEncryption]) -> Option<SessionEncryption>,
    /// Supplies credentials for each authentication round-trip.
    pub authenticator: Box<dyn ClientAuthenticator>,
}

impl ClientEstablishment {
    /// A recipe that prefers the strongest offered encryption, no
    /// compression, and guest authentication.
    pub fn guest(identity: Identity, instance: Option<String>) -> Self {
        Self {
            identity,
            instance,
            compression_selector: |options| {
                options.first().copied()
            },
            encryption_selector: |options| {
                if options.contains(&SessionEncryption::Tls) {
                    Some(SessionEncryption::Tls)
                } else {
                    options.first().copied()
                }
            },
            authenticator: Box::new(GuestAuthenticator),
        }
    }
}

/// Drive the client side of the handshake to completion.
///
/// Returns the final `Established` session envelope; any other terminal
/// outcome surfaces as [`ChannelError::SessionFailed`].
pub async fn establish_client(
    channel: &ClientChannel,
    options: &ClientEstablishment,
) -> Result<Session, ChannelError> {
    let mut session = channel.start_new_session().await?;

    if session.state == SessionState::Negotiating {
        session = negotiate_client(channel, options, session).await?;
    }

    let mut round_trip = None;
    while session.state == SessionState::Authenticating {
        let schemes = session.scheme_options.clone().unwrap_or_default();
        let authentication =
            options.authenticator.authenticate(&schemes, round_trip.take()).await?;
        session = channel
            .authenticate_session(&options.identity, options.instance.as_deref(), &authentication)
            .await?;
        if session.state == SessionState::Authenticating {
            round_trip = session.authentication().transpose().map_err(|error| {
                ChannelError::Envelope(error.to_string())
            })?;
        }
    }

    match session.state {
        SessionState::Established => Ok(session),
        SessionState::Failed => {
            let reason = session
                .reason
                .clone()
                .unwrap_or_else(|| Reason::new(codes::SESSION_ERROR, "session failed"));
            Err(ChannelError::SessionFailed(reason))
        },
        _ => Err(ChannelError::SessionFailed(Reason::new(
            codes::SESSION_ERROR,
            format!("could not establish the session (stuck in {:?})", session.state),
        ))),
    }
}

async fn negotiate_client(
    channel: &ClientChannel,
    options: &ClientEstablishment,
    offer: Session,
) -> Result<Session, ChannelError> {
    let compression_offer = offer.compression_options.unwrap_or_default();
    let encryption_offer = offer.encryption_options.unwrap_or_default();

    let compression = (options.compression_selector)(&compression_offer)
        .ok_or(ChannelError::InvalidOptions("no acceptable compression offered"))?;
    let encryption = (options.encryption_selector)(&encryption_offer)
        .ok_or(ChannelError::InvalidOptions("no acceptable encryption offered"))?;

    let confirmation = channel.negotiate_session(compression, encryption).await?;

    // Apply the confirmed options to the wire before the next handshake
    // step; the server does the same after sending its confirmation.
    if let Some(confirmed) = confirmation.compression {
        if confirmed != channel.transport().compression() {
            channel.transport().set_compression(confirmed).await?;
        }
    }
    if let Some(confirmed) = confirmation.encryption {
        if confirmed != channel.transport().encryption() {
            channel.transport().set_encryption(confirmed).await?;
        }
    }

    channel.base().receive_session().await
}

/// Verdict of a server-side authentication round.
pub enum AuthenticationOutcome {
    /// The credentials were accepted with the given domain role.
    Granted(DomainRole),
    /// Another round-trip is required; send this challenge to the client.
    RoundTrip(Authentication),
}

/// Server-side credential verifier.
#[async_trait]
pub trait ServerAuthenticator: Send + Sync {
    /// Verify one set of credentials.
    ///
    /// `transport_role` carries the transport's own verdict when it
    /// authenticated the identity itself (e.g. mutual TLS); the
    /// authenticator makes the final call.
    async fn authenticate(
        &self,
        identity: &Identity,
        authentication: &Authentication,
        transport_role: Option<DomainRole>,
    ) -> AuthenticationOutcome;
}

/// Assigns the effective node address for an authenticated client.
#[async_trait]
pub trait NodeRegistrar: Send + Sync {
    /// Register `candidate`, returning the effective address or `None`
    /// when registration is refused.
    async fn register(&self, candidate: Node) -> Option<Node>;

    /// Release an address returned by [`register`](Self::register).
    ///
    /// Called when establishment fails after the address was claimed, so
    /// the claim does not outlive the session it was made for.
    async fn unregister(&self, node: Node) {
        let _ = node;
    }
}

/// Accepts every candidate address unchanged, defaulting the instance.
#[derive(Clone, Copy, Debug, Default)]
pub struct AcceptAllRegistrar;

#[async_trait]
impl NodeRegistrar for AcceptAllRegistrar {
    async fn register(&self, candidate: Node) -> Option<Node> {
        Some(candidate.resolve_instance())
    }
}

/// The server's establishment recipe.
pub struct ServerEstablishment {
    /// Compression options to offer.
    pub compression_options: Vec<SessionCompression>,
    /// Encryption options to offer.
    pub encryption_options: Vec<SessionEncryption>,
    /// Authentication schemes to offer.
    pub scheme_options: Vec<AuthenticationScheme>,
    /// Verifies client credentials.
    pub authenticator: Box<dyn ServerAuthenticator>,
    /// Assigns effective node addresses.
    pub registrar: Box<dyn NodeRegistrar>,
}

/// Grants guest access to anyone as a domain member.
#[derive(Clone, Copy, Debug, Default)]
pub struct AcceptGuestsAuthenticator;

#[async_trait]
impl ServerAuthenticator for AcceptGuestsAuthenticator {
    async fn authenticate(
        &self,
        _identity: &Identity,
        authentication: &Authentication,
        transport_role: Option<DomainRole>,
    ) -> AuthenticationOutcome {
        match authentication {
            Authentication::Guest => AuthenticationOutcome::Granted(DomainRole::Member),
            _ => AuthenticationOutcome::Granted(transport_role.unwrap_or(DomainRole::Unknown)),
        }
    }
}

impl ServerEstablishment {
    /// A recipe offering cleartext transport and guest authentication.
    pub fn guest() -> Self {
        Self {
            compression_options: vec![SessionCompression::None],
            encryption_options: vec![SessionEncryption::None],
            scheme_options: vec![AuthenticationScheme::Guest],
            authenticator: Box::new(AcceptGuestsAuthenticator),
            registrar: Box::new(AcceptAllRegistrar),
        }
    }
}

/// Drive the server side of the handshake to completion.
///
/// Returns the registered client node on success, or `None` when the
/// session was refused (the refusal envelope has already been sent and
/// the channel closed).
pub async fn establish_server(
    channel: &ServerChannel,
    options: &ServerEstablishment,
) -> Result<Option<Node>, ChannelError> {
    validate_options(channel, options)?;

    channel.receive_new_session().await?;

    // Negotiation is a no-op when only one option exists on both axes.
    let negotiate = options.compression_options.len() > 1 || options.encryption_options.len() > 1;
    if negotiate {
        let selection = channel
            .negotiate_session(&options.compression_options, &options.encryption_options)
            .await?;
        let (compression, encryption) = match validate_selection(options, &selection) {
            Some(selected) => selected,
            None => {
                channel
                    .send_failed_session(Reason::new(
                        codes::SESSION_NEGOTIATION_INVALID_OPTIONS,
                        "the selected options are not supported",
                    ))
                    .await;
                return Ok(None);
            },
        };
        channel.send_negotiating_confirmation(compression, encryption).await?;
        if compression != channel.transport().compression() {
            channel.transport().set_compression(compression).await?;
        }
        if encryption != channel.transport().encryption() {
            channel.transport().set_encryption(encryption).await?;
        }
    }

    let mut session = channel.authenticate_session(&options.scheme_options).await?;

    loop {
        let Some(from_node) = session.from.clone() else {
            channel
                .send_failed_session(Reason::new(
                    codes::SESSION_AUTHENTICATION_FAILED,
                    "the envelope must carry the client identity",
                ))
                .await;
            return Ok(None);
        };
        let authentication = match session.authentication() {
            Some(Ok(authentication)) => authentication,
            _ => {
                channel
                    .send_failed_session(Reason::new(
                        codes::SESSION_AUTHENTICATION_FAILED,
                        "missing or malformed credentials",
                    ))
                    .await;
                return Ok(None);
            },
        };

        // Transport-level authentication feeds the verifier when the
        // client chose the transport scheme.
        let transport_role = if matches!(authentication, Authentication::Transport)
            && channel.transport().supports_authentication()
        {
            Some(channel.transport().authenticate(&from_node.identity).await?)
        } else {
            None
        };

        match options
            .authenticator
            .authenticate(&from_node.identity, &authentication, transport_role)
            .await
        {
            AuthenticationOutcome::Granted(role) if role >= DomainRole::Member => {
                let Some(node) = options.registrar.register(from_node).await else {
                    channel
                        .send_failed_session(Reason::new(
                            codes::SESSION_REGISTRATION_ERROR,
                            "the node address could not be registered",
                        ))
                        .await;
                    return Ok(None);
                };
                if let Err(error) = channel.send_established_session(node.clone()).await {
                    options.registrar.unregister(node).await;
                    return Err(error);
                }
                return Ok(Some(node));
            },
            AuthenticationOutcome::Granted(_) => {
                channel
                    .send_failed_session(Reason::new(
                        codes::SESSION_AUTHENTICATION_FAILED,
                        "the credentials were not accepted",
                    ))
                    .await;
                return Ok(None);
            },
            AuthenticationOutcome::RoundTrip(challenge) => {
                session = channel.send_authentication_challenge(&challenge).await?;
            },
        }
    }
}

fn validate_options(
    channel: &ServerChannel,
    options: &ServerEstablishment,
) -> Result<(), ChannelError> {
    if options.compression_options.is_empty()
        || options.encryption_options.is_empty()
        || options.scheme_options.is_empty()
    {
        return Err(ChannelError::InvalidOptions("handshake option lists must be non-empty"));
    }
    let transport = channel.transport();
    let supported_compression = transport.supported_compression();
    let supported_encryption = transport.supported_encryption();
    if !options.compression_options.iter().all(|c| supported_compression.contains(c)) {
        return Err(ChannelError::InvalidOptions(
            "offered compression not supported by the transport",
        ));
    }
    if !options.encryption_options.iter().all(|e| supported_encryption.contains(e)) {
        return Err(ChannelError::InvalidOptions(
            "offered encryption not supported by the transport",
        ));
    }
    Ok(())
}

fn validate_selection(
    options: &ServerEstablishment,
    selection: &Session,
) -> Option<(SessionCompression, SessionEncryption)> {
    let compression = selection.compression?;
    let encryption = selection.encryption?;
    if !options.compression_options.contains(&compression) {
        return None;
    }
    if !options.encryption_options.contains(&encryption) {
        return None;
    }
    Some((compression, encryption))
}
