//! Resource registration handshake.
//!
//! Runs on a freshly accepted Resource connection, with the relay as the
//! requester:
//! 1. Relay sends WHO_ARE_YOU with a random 32-byte challenge
//! 2. Resource answers with name, description, limit and, optionally, a
//!    public key plus a signature over the registration transcript
//! 3. Relay verifies the signature and checks the key against the
//!    authorized fingerprints
//! 4. Relay sends ENUM_COMMANDS to record the Resource's capabilities

use rand::Rng;
use revrpc_core::channel::Requester;
use revrpc_core::identity::{build_transcript, fingerprint, short_fingerprint, IdentityProvider};
use revrpc_core::messages::{self, codes, Introduction, CHALLENGE_LEN};
use revrpc_core::{RpcError, RpcResult};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

/// Identity requirements for registering Resources.
#[derive(Debug, Clone, Default)]
pub struct IdentityPolicy {
    pub require_signature: bool,
    /// Lowercase hex fingerprints. Empty allows any key.
    pub authorized_keys: Vec<String>,
}

/// Result of a successful handshake.
#[derive(Debug)]
pub struct Admitted {
    pub intro: Introduction,
    pub fingerprint: Option<String>,
    pub commands: Vec<u32>,
}

/// Generate a random registration challenge.
pub fn generate_challenge() -> Vec<u8> {
    let mut challenge = vec![0u8; CHALLENGE_LEN];
    rand::thread_rng().fill(&mut challenge[..]);
    challenge
}

/// Run the handshake over `requester`.
pub async fn admit<S>(
    requester: &mut Requester<S>,
    policy: &IdentityPolicy,
    verifier: &dyn IdentityProvider,
) -> RpcResult<Admitted>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let challenge = generate_challenge();
    let data = requester
        .call_ok(codes::WHO_ARE_YOU, challenge.clone())
        .await
        .map_err(|e| e.at("WHO_ARE_YOU"))?;
    let intro = Introduction::decode(&data)?;
    if intro.name.is_empty() {
        return Err(RpcError::Format("resource declared an empty name".into()));
    }

    let fingerprint = verify_introduction(&intro, &challenge, policy, verifier)?;

    let commands = match requester.call(codes::ENUM_COMMANDS, Vec::new()).await? {
        resp if resp.is_ok() => messages::decode_codes(&resp.data)?,
        resp => {
            debug!(name = %intro.name, status = format_args!("{:#010x}", resp.status), "resource did not list its commands");
            Vec::new()
        }
    };

    Ok(Admitted {
        intro,
        fingerprint,
        commands,
    })
}

/// Check the Resource's identity claim. Returns the key fingerprint for a
/// signed introduction, `None` for an anonymous one.
pub fn verify_introduction(
    intro: &Introduction,
    challenge: &[u8],
    policy: &IdentityPolicy,
    verifier: &dyn IdentityProvider,
) -> RpcResult<Option<String>> {
    if intro.is_anonymous() {
        if policy.require_signature {
            warn!(name = %intro.name, "anonymous resource rejected");
            return Err(RpcError::AuthFailed(format!(
                "resource {:?} must sign its registration",
                intro.name
            )));
        }
        return Ok(None);
    }

    let transcript = build_transcript(&intro.name, challenge);
    if !verifier.verify(&transcript, &intro.signature, &intro.public_key) {
        warn!(name = %intro.name, "registration signature did not verify");
        return Err(RpcError::AuthFailed(format!(
            "bad registration signature from {:?}",
            intro.name
        )));
    }

    let fp = fingerprint(&intro.public_key);
    if !policy.authorized_keys.is_empty() && !policy.authorized_keys.contains(&fp) {
        warn!(name = %intro.name, fingerprint = %short_fingerprint(&fp, 8), "key not authorized");
        return Err(RpcError::PermissionDenied(format!(
            "key {} is not authorized",
            short_fingerprint(&fp, 16)
        )));
    }
    Ok(Some(fp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use revrpc_core::channel::{Channel, ChannelOptions, HandlerTable};
    use revrpc_core::status;
    use revrpc_core::Ed25519Identity;

    fn signed(identity: &Ed25519Identity, name: &str, challenge: &[u8]) -> Introduction {
        Introduction {
            name: name.to_string(),
            description: String::new(),
            command_data_limit: 64,
            public_key: identity.public_key(),
            signature: identity.sign(&build_transcript(name, challenge)),
        }
    }

    fn anonymous(name: &str) -> Introduction {
        Introduction {
            name: name.to_string(),
            description: String::new(),
            command_data_limit: 64,
            public_key: Vec::new(),
            signature: Vec::new(),
        }
    }

    #[test]
    fn challenges_are_random() {
        let a = generate_challenge();
        assert_eq!(a.len(), CHALLENGE_LEN);
        assert_ne!(a, generate_challenge());
    }

    #[test]
    fn signed_introduction_verifies() {
        let verifier = Ed25519Identity::generate();
        let resource = Ed25519Identity::generate();
        let challenge = generate_challenge();
        let intro = signed(&resource, "Printer", &challenge);

        let fp = verify_introduction(&intro, &challenge, &IdentityPolicy::default(), &verifier)
            .unwrap();
        assert_eq!(fp, Some(resource.fingerprint()));
    }

    #[test]
    fn signature_over_other_challenge_fails() {
        let verifier = Ed25519Identity::generate();
        let resource = Ed25519Identity::generate();
        let intro = signed(&resource, "Printer", &generate_challenge());

        let err = verify_introduction(
            &intro,
            &generate_challenge(),
            &IdentityPolicy::default(),
            &verifier,
        )
        .unwrap_err();
        assert_eq!(err.status(), status::AUTH_FAILED);
    }

    #[test]
    fn anonymous_needs_permission() {
        let verifier = Ed25519Identity::generate();
        let challenge = generate_challenge();
        let open = IdentityPolicy::default();
        assert_eq!(
            verify_introduction(&anonymous("Echo"), &challenge, &open, &verifier).unwrap(),
            None
        );

        let strict = IdentityPolicy {
            require_signature: true,
            ..IdentityPolicy::default()
        };
        let err = verify_introduction(&anonymous("Echo"), &challenge, &strict, &verifier)
            .unwrap_err();
        assert_eq!(err.status(), status::AUTH_FAILED);
    }

    #[test]
    fn authorized_keys_are_enforced() {
        let verifier = Ed25519Identity::generate();
        let trusted = Ed25519Identity::generate();
        let stranger = Ed25519Identity::generate();
        let policy = IdentityPolicy {
            require_signature: true,
            authorized_keys: vec![trusted.fingerprint()],
        };
        let challenge = generate_challenge();

        let ok = signed(&trusted, "A", &challenge);
        assert!(verify_introduction(&ok, &challenge, &policy, &verifier).is_ok());

        let refused = signed(&stranger, "B", &challenge);
        let err = verify_introduction(&refused, &challenge, &policy, &verifier).unwrap_err();
        assert_eq!(err.status(), status::PERMISSION_DENIED);
    }

    #[tokio::test]
    async fn admit_over_channel() {
        let (relay_side, resource_side) = tokio::io::duplex(64 * 1024);
        let table = HandlerTable::new()
            .with(codes::WHO_ARE_YOU, |_challenge: Vec<u8>| async move {
                Ok::<_, RpcError>(anonymous("Echo").encode())
            })
            .with(codes::SEND, |d: Vec<u8>| async move { Ok::<_, RpcError>(d) });
        tokio::spawn(Channel::new(resource_side, ChannelOptions::default()).serve(table));

        let mut requester = Channel::new(relay_side, ChannelOptions::default()).into_requester();
        let verifier = Ed25519Identity::generate();
        let admitted = admit(&mut requester, &IdentityPolicy::default(), &verifier)
            .await
            .unwrap();
        assert_eq!(admitted.intro.name, "Echo");
        assert!(admitted.fingerprint.is_none());
        assert_eq!(
            admitted.commands,
            vec![codes::ENUM_COMMANDS, codes::SEND, codes::WHO_ARE_YOU]
        );
    }

    #[tokio::test]
    async fn admit_rejects_resource_without_who_are_you() {
        let (relay_side, resource_side) = tokio::io::duplex(1024);
        let resource = Channel::new(resource_side, ChannelOptions::default());
        tokio::spawn(resource.serve(HandlerTable::new()));

        let mut requester = Channel::new(relay_side, ChannelOptions::default()).into_requester();
        let verifier = Ed25519Identity::generate();
        let err = admit(&mut requester, &IdentityPolicy::default(), &verifier)
            .await
            .unwrap_err();
        assert_eq!(err.location(), Some("WHO_ARE_YOU"));
        assert_eq!(err.status(), status::COMMAND_NOT_SUPPORTED);
    }
}
