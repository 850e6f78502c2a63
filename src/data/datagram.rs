//! Parsing of the textual datagram format sent by the digitizer.
//!
//! A datagram looks like `{'EHZ', 1700000000.123, 512, 498, 503}`: a quoted
//! channel id, a float timestamp in seconds, then any number of integer samples.

use crate::error::{GatewayError, GatewayResult};

/// A decoded datagram.
#[derive(Debug, Clone, PartialEq)]
pub struct Datagram {
    /// Logical channel the samples belong to
    pub channel_id: String,
    /// Source timestamp, seconds since the Unix epoch
    pub timestamp: f64,
    /// Raw sample values in arrival order
    pub values: Vec<i64>,
}

/// Decode one datagram.
///
/// Fails with [`GatewayError::Datagram`] when the channel or timestamp is missing or
/// any field does not parse.
pub fn parse_datagram(text: &str) -> GatewayResult<Datagram> {
    let body = text
        .trim()
        .trim_start_matches('{')
        .trim_end_matches('}');
    let mut fields = body.split(", ");

    let channel_id = fields
        .next()
        .map(|f| f.trim_matches('\''))
        .filter(|f| !f.is_empty())
        .ok_or_else(|| GatewayError::Datagram("missing channel id".to_string()))?
        .to_string();

    let timestamp = fields
        .next()
        .ok_or_else(|| GatewayError::Datagram("missing timestamp".to_string()))?;
    let timestamp: f64 = timestamp
        .trim()
        .parse()
        .map_err(|_| GatewayError::Datagram(format!("invalid timestamp '{timestamp}'")))?;

    let values = fields
        .map(|field| {
            field
                .trim()
                .parse::<i64>()
                .map_err(|_| GatewayError::Datagram(format!("invalid sample '{field}'")))
        })
        .collect::<GatewayResult<Vec<_>>>()?;

    Ok(Datagram {
        channel_id,
        timestamp,
        values,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_typical_datagram() {
        let datagram = parse_datagram("{'EHZ', 1700000000.123, 12, -34, 56}").unwrap();
        assert_eq!(datagram.channel_id, "EHZ");
        assert_eq!(datagram.timestamp, 1700000000.123);
        assert_eq!(datagram.values, vec![12, -34, 56]);
    }

    #[test]
    fn test_trailing_newline_is_ignored() {
        let datagram = parse_datagram("{'ENZ', 2.5, 1}\n").unwrap();
        assert_eq!(datagram.channel_id, "ENZ");
        assert_eq!(datagram.values, vec![1]);
    }

    #[test]
    fn test_datagram_without_samples() {
        let datagram = parse_datagram("{'EHZ', 10.0}").unwrap();
        assert!(datagram.values.is_empty());
    }

    #[test]
    fn test_malformed_datagrams_are_dropped() {
        for bad in [
            "",
            "{}",
            "{'EHZ'}",
            "{'EHZ', noon, 1}",
            "{'EHZ', 1.0, 1.5}",
            "{'EHZ', 1.0, 1,2}",
        ] {
            let err = parse_datagram(bad).unwrap_err();
            assert_eq!(err.severity(), crate::error::Severity::Dropped, "{bad:?}");
        }
    }
}
