//! Wire codec for job messages.
//!
//! Jobs travel as compact JSON objects:
//!
//! ```text
//! {"participants":["A","B"],"scenario":"m1","job_id":"000000"}
//! ```
//!
//! `decode` validates the job after parsing, so every way a payload can be
//! unusable surfaces as [`CodecError::MalformedMessage`] and the worker can
//! dead-letter it instead of retrying.

use crate::error::CodecError;

use super::job::Job;

/// Serializes a job into a transport payload.
pub fn encode(job: &Job) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(job)?)
}

/// Parses and validates a transport payload.
pub fn decode(payload: &[u8]) -> Result<Job, CodecError> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| CodecError::malformed(format!("payload is not UTF-8: {}", e)))?;

    let job: Job = serde_json::from_str(text).map_err(|e| CodecError::malformed(e.to_string()))?;
    job.validate()?;

    Ok(job)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_wire_format() {
        let job = Job::new(["A", "B"], "m1", "000000");
        let payload = encode(&job).expect("encode should work");

        assert_eq!(
            std::str::from_utf8(&payload).unwrap(),
            r#"{"participants":["A","B"],"scenario":"m1","job_id":"000000"}"#
        );
    }

    #[test]
    fn test_decode_round_trip() {
        let job = Job::new(["Marian Devecka", "PurpleWave", "Iron"], "(4)Python.scx", "00AB12CD_000001");
        let payload = encode(&job).unwrap();

        assert_eq!(decode(&payload).unwrap(), job);
        assert_eq!(encode(&decode(&payload).unwrap()).unwrap(), payload);
    }

    #[test]
    fn test_requeue_counter_survives_encoding() {
        let job = Job::new(["A", "B"], "m1", "000000").requeued();
        let payload = encode(&job).unwrap();

        assert!(std::str::from_utf8(&payload).unwrap().contains("\"requeues\":1"));
        assert_eq!(decode(&payload).unwrap().requeues, 1);
    }

    #[test]
    fn test_decode_legacy_field_names() {
        let payload = br#"{"bots":["A","B"],"map":"m1","game_name":"9F00AA11_000003"}"#;
        let job = decode(payload).unwrap();

        assert_eq!(job.participants, vec!["A", "B"]);
        assert_eq!(job.scenario, "m1");
        assert_eq!(job.job_id, "9F00AA11_000003");
    }

    #[test]
    fn test_decode_missing_fields_is_malformed() {
        let cases: [&[u8]; 4] = [
            br#"{"scenario":"m1","job_id":"1"}"#,
            br#"{"participants":["A","B"],"job_id":"1"}"#,
            br#"{"participants":["A","B"],"scenario":"m1"}"#,
            b"not json at all",
        ];

        for payload in cases {
            assert!(
                matches!(decode(payload), Err(CodecError::MalformedMessage { .. })),
                "payload {:?} should be malformed",
                String::from_utf8_lossy(payload)
            );
        }
    }

    #[test]
    fn test_decode_rejects_invalid_utf8() {
        let err = decode(&[0xff, 0xfe, 0x00]).unwrap_err();
        assert!(err.to_string().contains("UTF-8"));
    }

    #[test]
    fn test_decode_rejects_invalid_job() {
        let payload = br#"{"participants":["A","A"],"scenario":"m1","job_id":"1"}"#;
        assert!(matches!(
            decode(payload),
            Err(CodecError::MalformedMessage { .. })
        ));
    }
}
