//! Server side of the login handshake
//!
//! A login runs over its own [`ChunkChannel`]: the client's request is read,
//! checked against the server's protocol version and addon list, admitted by
//! the dispatch loop and answered with the response.

use log::{debug, info};
use protocol::handshake::{
    decode_message, encode_message, negotiate_addons, AddonInfo, LoginRequest, LoginResponse,
    PROTOCOL_VERSION,
};
use protocol::error::HandshakeError;
use protocol::{ChunkChannel, SecureTransport};

/// Longest username the server accepts.
pub const MAX_USERNAME_LENGTH: usize = 32;

/// Checks a request and returns the addon ids to assign, or the reason for
/// rejecting it.
pub fn validate_request(request: &LoginRequest, server_addons: &[AddonInfo]) -> Result<Vec<u8>, String> {
    if request.protocol_version != PROTOCOL_VERSION {
        return Err(format!(
            "protocol version {} does not match server version {}",
            request.protocol_version, PROTOCOL_VERSION
        ));
    }

    let username = request.username.trim();
    if username.is_empty() {
        return Err("username is empty".to_string());
    }
    if username.chars().count() > MAX_USERNAME_LENGTH {
        return Err(format!(
            "username is longer than {} characters",
            MAX_USERNAME_LENGTH
        ));
    }

    negotiate_addons(server_addons, &request.addons)
}

/// Reads the client's login request.
pub async fn receive_request<T: SecureTransport>(
    channel: &mut ChunkChannel<T>,
) -> Result<LoginRequest, HandshakeError> {
    let bytes = channel.recv().await?;
    let request: LoginRequest = decode_message(&bytes)?;
    debug!(
        "Login request from {} with {} addons",
        request.username,
        request.addons.len()
    );
    Ok(request)
}

/// Sends the response and waits until the client has all of it.
pub async fn send_response<T: SecureTransport>(
    channel: &mut ChunkChannel<T>,
    response: &LoginResponse,
) -> Result<(), HandshakeError> {
    match response {
        LoginResponse::Accepted { player_id, .. } => {
            info!("Accepted login as player {}", player_id)
        }
        LoginResponse::Rejected { reason } => info!("Rejected login: {}", reason),
    }
    channel.send(encode_message(response)?).await
}
