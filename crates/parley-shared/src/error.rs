use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TokenError {
    #[error("Token is not valid base64")]
    Encoding,

    #[error("Token payload is malformed: {0}")]
    Malformed(String),

    #[error("Token signature is invalid")]
    BadSignature,

    #[error("Issuer key is invalid")]
    BadIssuerKey,

    #[error("Token expired")]
    Expired,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MessageError {
    #[error("User id must not be empty")]
    EmptyUserId,

    #[error("Message must carry text or an image")]
    EmptyMessage,
}
