//! Frame parsing
//!
//! Turns one raw device line into a typed shot event or rejects it as
//! malformed. Expected shape is three colon-separated fields:
//! `<channel-label>:<current>:<duration>`. The channel label is matched
//! case-insensitively against an enumerated table; anything else is a parse
//! error, never a crash, and never stalls ingestion of later frames.

use std::collections::HashMap;

use ferro_common::error::{Error, Result};
use ferro_common::types::Channel;

/// One successfully parsed measurement frame, not yet classified
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShotFrame {
    pub channel: Channel,
    /// Peak current magnitude in amperes
    pub current: f64,
    /// Shot duration in seconds
    pub duration: f64,
}

/// Enumerated channel-label table, keyed by lowercased label
#[derive(Debug, Clone)]
pub struct ChannelLabels {
    labels: HashMap<String, Channel>,
}

impl ChannelLabels {
    /// Table with no entries; labels must be added before anything parses
    pub fn empty() -> Self {
        Self { labels: HashMap::new() }
    }

    pub fn insert(&mut self, label: &str, channel: Channel) {
        self.labels.insert(label.trim().to_lowercase(), channel);
    }

    pub fn resolve(&self, label: &str) -> Option<Channel> {
        self.labels.get(&label.trim().to_lowercase()).copied()
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

impl Default for ChannelLabels {
    /// The fixture's stock meter naming
    fn default() -> Self {
        let mut table = Self::empty();
        table.insert("Meter 1", Channel::Headshot);
        table.insert("Meter 2", Channel::Coilshot);
        table
    }
}

/// Parser for raw device frames
#[derive(Debug, Clone, Default)]
pub struct FrameParser {
    labels: ChannelLabels,
}

impl FrameParser {
    pub fn new(labels: ChannelLabels) -> Self {
        Self { labels }
    }

    /// Parse a raw line into a [`ShotFrame`].
    ///
    /// Pure function of the input and the label table; every failure mode is
    /// an [`Error::Parse`] describing what was wrong with the frame.
    pub fn parse(&self, line: &str) -> Result<ShotFrame> {
        let fields: Vec<&str> = line.trim().split(':').collect();
        if fields.len() != 3 {
            return Err(Error::Parse(format!(
                "expected 3 colon-separated fields, got {} in {line:?}",
                fields.len()
            )));
        }

        let channel = self
            .labels
            .resolve(fields[0])
            .ok_or_else(|| Error::Parse(format!("unknown channel label {:?}", fields[0])))?;

        let current: f64 = fields[1]
            .trim()
            .parse()
            .map_err(|_| Error::Parse(format!("non-numeric current {:?}", fields[1])))?;

        let duration: f64 = fields[2]
            .trim()
            .parse()
            .map_err(|_| Error::Parse(format!("non-numeric duration {:?}", fields[2])))?;

        Ok(ShotFrame { channel, current, duration })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stock_meter_labels() {
        let parser = FrameParser::default();
        let frame = parser.parse("Meter 1:12.5:0.75").unwrap();
        assert_eq!(frame.channel, Channel::Headshot);
        assert_eq!(frame.current, 12.5);
        assert_eq!(frame.duration, 0.75);

        let frame = parser.parse("Meter 2:3.0:0.5").unwrap();
        assert_eq!(frame.channel, Channel::Coilshot);
    }

    #[test]
    fn label_match_is_case_insensitive_and_trimmed() {
        let parser = FrameParser::default();
        assert!(parser.parse("METER 1:1.0:1.0").is_ok());
        assert!(parser.parse("  meter 2 : 1.0 : 1.0 ").is_ok());
    }

    #[test]
    fn unknown_label_is_a_parse_error() {
        let parser = FrameParser::default();
        let err = parser.parse("Meter 9:12.3:0.5").unwrap_err();
        assert!(matches!(err, Error::Parse(_)), "got {err:?}");
    }

    #[test]
    fn non_numeric_fields_are_parse_errors() {
        let parser = FrameParser::default();
        assert!(matches!(parser.parse("Meter 1:abc:0.5"), Err(Error::Parse(_))));
        assert!(matches!(parser.parse("Meter 1:1.0:xyz"), Err(Error::Parse(_))));
    }

    #[test]
    fn wrong_field_count_is_a_parse_error() {
        let parser = FrameParser::default();
        assert!(matches!(parser.parse("Meter 1:1.0"), Err(Error::Parse(_))));
        assert!(matches!(parser.parse("Meter 1:1.0:0.5:extra"), Err(Error::Parse(_))));
        assert!(matches!(parser.parse(""), Err(Error::Parse(_))));
    }

    #[test]
    fn custom_label_table_overrides_stock_names() {
        let mut labels = ChannelLabels::empty();
        labels.insert("HEAD", Channel::Headshot);
        labels.insert("coil", Channel::Coilshot);
        let parser = FrameParser::new(labels);

        assert_eq!(parser.parse("head:2.0:0.1").unwrap().channel, Channel::Headshot);
        assert_eq!(parser.parse("Coil:2.0:0.1").unwrap().channel, Channel::Coilshot);
        assert!(parser.parse("Meter 1:2.0:0.1").is_err());
    }
}
