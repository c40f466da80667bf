//! Helpers shared by SCPI instruments.
//!
//! SCPI devices report errors through a queue read with `SYST:ERR?`. Each
//! entry is `<code>,"<message>"`; code 0 means the queue is empty.

use crate::error::{LabError, Result};
use crate::transport::MessageTransport;

/// Longest error queue drained in one check.
const MAX_QUEUED_ERRORS: usize = 20;

/// One `SYST:ERR?` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScpiError {
    pub code: i32,
    pub message: String,
}

/// Parse `-113,"Undefined header"` or `+0,"No error"`.
pub fn parse_error(reply: &str) -> Option<ScpiError> {
    let (code, message) = reply.trim().split_once(',')?;
    let code = code.trim().trim_start_matches('+').parse().ok()?;
    Some(ScpiError {
        code,
        message: message.trim().trim_matches('"').to_string(),
    })
}

/// Drain the error queue, failing with every queued message if any.
pub async fn check_errors(transport: &MessageTransport) -> Result<()> {
    let mut errors = Vec::new();
    for _ in 0..MAX_QUEUED_ERRORS {
        let reply = transport.query("SYST:ERR?").await?;
        let entry = parse_error(&reply).ok_or_else(|| {
            LabError::parse(transport.name(), "SYST:ERR?", &reply, "expected <code>,\"<message>\"")
        })?;
        if entry.code == 0 {
            break;
        }
        errors.push(format!("{} {}", entry.code, entry.message));
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(LabError::instrument(transport.name(), errors.join("; ")))
    }
}

/// Read `*IDN?` and check it names the expected model.
pub async fn identify(transport: &MessageTransport, model: &str) -> Result<String> {
    let idn = transport.query("*IDN?").await?;
    if !idn.to_ascii_uppercase().contains(&model.to_ascii_uppercase()) {
        return Err(LabError::instrument(
            transport.name(),
            format!("*IDN? reply {idn:?} does not name a {model}"),
        ));
    }
    Ok(idn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockInstrument;
    use crate::transport::TransportOptions;

    #[test]
    fn parses_error_entries() {
        assert_eq!(
            parse_error("-113,\"Undefined header\""),
            Some(ScpiError {
                code: -113,
                message: "Undefined header".into()
            })
        );
        assert_eq!(parse_error("+0,\"No error\"").map(|e| e.code), Some(0));
        assert_eq!(parse_error("garbage"), None);
    }

    #[tokio::test]
    async fn check_errors_collects_queue() {
        let (t, log) = MockInstrument::new()
            .on("SYST:ERR?", "-222,\"Data out of range\"")
            .on("SYST:ERR?", "-113,\"Undefined header\"")
            .on("SYST:ERR?", "+0,\"No error\"")
            .spawn_transport("gen", TransportOptions::default());

        match check_errors(&t).await {
            Err(LabError::Instrument { message, .. }) => {
                assert!(message.contains("Data out of range"));
                assert!(message.contains("Undefined header"));
            }
            other => panic!("expected instrument error, got {other:?}"),
        }
        assert_eq!(log.count("SYST:ERR?"), 3);
        assert!(check_errors(&t).await.is_ok());
    }

    #[tokio::test]
    async fn identify_checks_model() {
        let (t, _log) = MockInstrument::new()
            .on("*IDN?", "Thorlabs,PM100D,P0012345,2.4.0")
            .spawn_transport("pm", TransportOptions::default());
        assert!(identify(&t, "PM100").await.is_ok());
        assert!(identify(&t, "33220A").await.is_err());
    }
}
