use std::string::FromUtf8Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid version: {0}")]
    InvalidVersion(i16),
    #[error("Truncated user data: need {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },
    #[error("Negative length: {0}")]
    NegativeLength(i32),
    #[error("Invalid topic name: {0}")]
    InvalidTopicName(#[from] FromUtf8Error),
    #[error("Array too long: {0} entries")]
    ArrayTooLong(usize),
    #[error("Topic name too long: {0} bytes")]
    TopicNameTooLong(usize),
    #[error("Trailing bytes after user data: {0}")]
    TrailingBytes(usize),
}
