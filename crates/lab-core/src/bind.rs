//! Reader/writer closures that bind feats to transport commands.
//!
//! Most feats are "send this query, parse the reply" plus "format this
//! command". These helpers build the boxed async closures `Feat` and
//! `DictFeat` expect, so a driver declares a feat in a few lines:
//!
//! ```rust,ignore
//! let frequency = Feat::<f64>::new("frequency")
//!     .with_unit(units::HERTZ)
//!     .with_reader(bind::reader(&t, "FREQ?", bind::number))
//!     .with_writer(bind::writer(&t, |hz| Ok(format!("FREQ {hz}"))));
//! ```
//!
//! Parse failures raised by the parse function without a device or command
//! are filled in with the transport name and the query that produced them.

use std::str::FromStr;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::{LabError, Result};
use crate::transport::MessageTransport;

/// Parse a numeric reply (`+1.234E-03`, `0800`, ` 7 `).
pub fn number<T>(reply: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    reply
        .trim()
        .trim_start_matches('+')
        .parse::<T>()
        .map_err(|e| LabError::parse("", "", reply, e.to_string()))
}

/// Parse a `0`/`1` reply as a bool.
pub fn flag(reply: &str) -> Result<bool> {
    match reply.trim() {
        "1" | "+1" | "ON" | "on" => Ok(true),
        "0" | "+0" | "OFF" | "off" => Ok(false),
        other => Err(LabError::parse("", "", other, "expected 0 or 1")),
    }
}

/// Return the trimmed reply unchanged.
pub fn text(reply: &str) -> Result<String> {
    Ok(reply.trim().to_string())
}

/// Query `command` and parse the reply.
pub fn reader<T, P>(
    transport: &Arc<MessageTransport>,
    command: impl Into<String>,
    parse: P,
) -> impl Fn() -> BoxFuture<'static, Result<T>> + Send + Sync + 'static
where
    T: Send + 'static,
    P: Fn(&str) -> Result<T> + Send + Sync + 'static,
{
    let transport = Arc::clone(transport);
    let command: Arc<str> = command.into().into();
    let parse = Arc::new(parse);
    move || {
        let (t, c, p) = (Arc::clone(&transport), Arc::clone(&command), Arc::clone(&parse));
        Box::pin(async move {
            let reply = t.query(&c).await?;
            p(&reply).map_err(|e| with_context(e, t.name(), &c))
        })
    }
}

/// Write the command `format` produces for each value.
pub fn writer<T, F>(
    transport: &Arc<MessageTransport>,
    format: F,
) -> impl Fn(T) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static
where
    T: Send + 'static,
    F: Fn(&T) -> Result<String> + Send + Sync + 'static,
{
    let transport = Arc::clone(transport);
    move |value| {
        let t = Arc::clone(&transport);
        let command = format(&value);
        Box::pin(async move { t.write(&command?).await })
    }
}

/// Keyed variant of [`reader`]: the query depends on the channel key.
pub fn keyed_reader<K, T, C, P>(
    transport: &Arc<MessageTransport>,
    command: C,
    parse: P,
) -> impl Fn(K) -> BoxFuture<'static, Result<T>> + Send + Sync + 'static
where
    K: Send + 'static,
    T: Send + 'static,
    C: Fn(&K) -> String + Send + Sync + 'static,
    P: Fn(&str) -> Result<T> + Send + Sync + 'static,
{
    let transport = Arc::clone(transport);
    let parse = Arc::new(parse);
    move |key| {
        let (t, p) = (Arc::clone(&transport), Arc::clone(&parse));
        let c = command(&key);
        Box::pin(async move {
            let reply = t.query(&c).await?;
            p(&reply).map_err(|e| with_context(e, t.name(), &c))
        })
    }
}

/// Keyed variant of [`writer`].
pub fn keyed_writer<K, T, F>(
    transport: &Arc<MessageTransport>,
    format: F,
) -> impl Fn(K, T) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static
where
    K: Send + 'static,
    T: Send + 'static,
    F: Fn(&K, &T) -> Result<String> + Send + Sync + 'static,
{
    let transport = Arc::clone(transport);
    move |key, value| {
        let t = Arc::clone(&transport);
        let command = format(&key, &value);
        Box::pin(async move { t.write(&command?).await })
    }
}

fn with_context(err: LabError, device: &str, command: &str) -> LabError {
    match err {
        LabError::Parse {
            device: d,
            command: c,
            response,
            reason,
        } => LabError::Parse {
            device: if d.is_empty() { device.to_string() } else { d },
            command: if c.is_empty() { command.to_string() } else { c },
            response,
            reason,
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feat::Feat;
    use crate::mock::MockInstrument;
    use crate::transport::TransportOptions;

    #[test]
    fn number_and_flag_parsing() {
        assert_eq!(number::<f64>(" +1.5E-3 ").unwrap(), 1.5e-3);
        assert_eq!(number::<u16>("0800").unwrap(), 800);
        assert!(flag("1").unwrap());
        assert!(!flag("0").unwrap());
        assert!(flag("2").is_err());
    }

    #[tokio::test]
    async fn bound_feat_round_trip() {
        let (t, log) = MockInstrument::new()
            .on("FREQ?", "1000.5")
            .spawn_transport("gen", TransportOptions::default());
        let t = Arc::new(t);
        let freq = Feat::<f64>::new("frequency")
            .with_reader(reader(&t, "FREQ?", number))
            .with_writer(writer(&t, |hz: &f64| Ok(format!("FREQ {hz}"))));

        assert_eq!(freq.get().await.unwrap(), 1000.5);
        freq.set(20.0).await.unwrap();
        assert!(log.wait_for("FREQ 20", std::time::Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn parse_errors_name_device_and_command() {
        let (t, _log) = MockInstrument::new()
            .on("FREQ?", "garbage")
            .spawn_transport("gen", TransportOptions::default());
        let t = Arc::new(t);
        let read = reader(&t, "FREQ?", number::<f64>);
        match read().await {
            Err(LabError::Parse {
                device, command, ..
            }) => {
                assert_eq!(device, "gen");
                assert_eq!(command, "FREQ?");
            }
            other => panic!("expected parse error, got {other:?}"),
        }
    }
}
