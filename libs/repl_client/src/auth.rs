//! Drives the four authentication sub-protocols behind the origin's `R`
//! auth-type message, spec.md §4.1.

use bytes::{Buf, Bytes};
use pgmoneta_proto::{
    self as proto, frame, md5::encrypt_md5_password, scram::ScramClient, AuthRequest, ScramError,
};
use pgmoneta_utils::PgmonetaError;
use tokio::io::{AsyncRead, AsyncWrite};

#[derive(Debug, thiserror::Error)]
pub enum AuthFlowError {
    #[error(transparent)]
    Wire(#[from] frame::WireError),
    #[error(transparent)]
    Scram(#[from] ScramError),
    #[error("unsupported auth type {0:?} offered by origin")]
    Unsupported(AuthRequest),
    #[error("origin rejected startup: {0}")]
    StartupRejected(String),
}

impl From<AuthFlowError> for PgmonetaError {
    fn from(e: AuthFlowError) -> Self {
        PgmonetaError::Auth(e.to_string())
    }
}

/// Runs the authentication sub-protocol selected by the origin's first
/// `AuthenticationRequest`. `stream` must already be positioned right
/// after the startup message was sent.
pub async fn authenticate<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    user: &str,
    password: &str,
) -> Result<(), AuthFlowError> {
    loop {
        let frame = frame::read_frame(stream).await?;
        match frame.kind {
            b'R' => {
                let req = proto::parse_auth_request(frame.payload)?;
                match req {
                    AuthRequest::Ok => return Ok(()),
                    AuthRequest::CleartextPassword => {
                        send_password_message(stream, password).await?;
                    }
                    AuthRequest::Md5Password { salt } => {
                        let hashed = encrypt_md5_password(user, password, &salt);
                        send_password_message(stream, &hashed).await?;
                    }
                    AuthRequest::SaslInit { ref mechanisms } => {
                        if !mechanisms.iter().any(|m| m == proto::SCRAM_SHA_256) {
                            return Err(AuthFlowError::Unsupported(req));
                        }
                        run_scram(stream, password).await?;
                    }
                    other @ (AuthRequest::SaslContinue { .. }
                    | AuthRequest::SaslFinal { .. }
                    | AuthRequest::Unknown(_)) => {
                        return Err(AuthFlowError::Unsupported(other));
                    }
                }
            }
            b'E' => {
                let fields = proto::parse_error_response(frame.payload);
                return Err(AuthFlowError::StartupRejected(
                    fields.message.unwrap_or_default(),
                ));
            }
            b'N' => continue, // NoticeResponse: ignore, keep waiting for auth/ready
            _ => continue,
        }
    }
}

async fn send_password_message<S: AsyncWrite + Unpin>(
    stream: &mut S,
    password: &str,
) -> Result<(), frame::WireError> {
    let mut body = Vec::with_capacity(password.len() + 1);
    body.extend_from_slice(password.as_bytes());
    body.push(0);
    frame::write_frame(stream, b'p', &body).await
}

async fn run_scram<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    password: &str,
) -> Result<(), AuthFlowError> {
    let mut client = ScramClient::new(password);
    let client_first = client.client_first_message();

    let mut body = Vec::new();
    body.extend_from_slice(proto::SCRAM_SHA_256.as_bytes());
    body.push(0);
    body.extend_from_slice(&(client_first.len() as i32).to_be_bytes());
    body.extend_from_slice(client_first.as_bytes());
    frame::write_frame(stream, b'p', &body).await?;

    let frame = frame::read_frame(stream).await?;
    let server_first = match proto::parse_auth_request(frame.payload)? {
        AuthRequest::SaslContinue { data } => decode_utf8(data)?,
        other => return Err(AuthFlowError::Unsupported(other)),
    };
    let client_final = client.handle_server_first(&server_first)?;
    frame::write_frame(stream, b'p', client_final.as_bytes()).await?;

    let frame = frame::read_frame(stream).await?;
    match proto::parse_auth_request(frame.payload)? {
        AuthRequest::SaslFinal { data } => {
            let server_final = decode_utf8(data)?;
            client.verify_server_final(&server_final)?;
        }
        AuthRequest::Ok => {}
        other => return Err(AuthFlowError::Unsupported(other)),
    }

    // Origin sends a final bare AuthenticationOk after SASL completes.
    let frame = frame::read_frame(stream).await?;
    if frame.kind == b'R' {
        if let AuthRequest::Ok = proto::parse_auth_request(frame.payload)? {
            return Ok(());
        }
    }
    Ok(())
}

fn decode_utf8(mut data: Bytes) -> Result<String, AuthFlowError> {
    let bytes = data.copy_to_bytes(data.len());
    String::from_utf8(bytes.to_vec())
        .map_err(|_| AuthFlowError::StartupRejected("non-utf8 SASL payload".to_string()))
}
