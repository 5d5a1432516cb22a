use crate::types::Submission;
use redis::{AsyncCommands, RedisResult};

/// Redis queue semantics - shared by whoever enqueues submissions and the
/// worker, so both sides agree on key names

pub const QUEUE_KEY: &str = "verdict:queue";
pub const SUBMISSION_PREFIX: &str = "verdict:submission";

/// Key holding the JSON record of a submission
pub fn submission_key(id: u64) -> String {
    format!("{}:{}", SUBMISSION_PREFIX, id)
}

fn serialization_error(e: serde_json::Error) -> redis::RedisError {
    redis::RedisError::from((
        redis::ErrorKind::TypeError,
        "serialization error",
        e.to_string(),
    ))
}

/// Push a submission id to the queue
/// Uses RPUSH for FIFO semantics
pub async fn push_submission(
    conn: &mut redis::aio::ConnectionManager,
    id: u64,
) -> RedisResult<()> {
    conn.rpush(QUEUE_KEY, id).await
}

/// Pop the next submission id
/// Uses BLPOP with timeout so the caller can observe shutdown
pub async fn pop_submission(
    conn: &mut redis::aio::ConnectionManager,
    timeout_seconds: f64,
) -> RedisResult<Option<u64>> {
    let result: Option<(String, u64)> = conn.blpop(QUEUE_KEY, timeout_seconds).await?;
    Ok(result.map(|(_key, id)| id))
}

/// Store a submission record. Records have no TTL: the owner decides when they go.
pub async fn store_submission(
    conn: &mut redis::aio::ConnectionManager,
    submission: &Submission,
) -> RedisResult<()> {
    let payload = serde_json::to_string(submission).map_err(serialization_error)?;
    conn.set(submission_key(submission.id), payload).await
}

/// Retrieve a submission record
pub async fn load_submission(
    conn: &mut redis::aio::ConnectionManager,
    id: u64,
) -> RedisResult<Option<Submission>> {
    let payload: Option<String> = conn.get(submission_key(id)).await?;

    match payload {
        Some(data) => {
            let submission: Submission = serde_json::from_str(&data).map_err(|e| {
                redis::RedisError::from((
                    redis::ErrorKind::TypeError,
                    "deserialization error",
                    e.to_string(),
                ))
            })?;
            Ok(Some(submission))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submission_key_format() {
        assert_eq!(submission_key(17), "verdict:submission:17");
        assert!(submission_key(u64::MAX).starts_with("verdict:submission:"));
    }

    #[test]
    fn test_submission_key_deterministic() {
        assert_eq!(submission_key(99), submission_key(99));
        assert_ne!(submission_key(99), submission_key(100));
    }
}
