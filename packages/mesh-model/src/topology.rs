//! Directed topology edges and SNR link classification.

use serde::{Deserialize, Serialize};

use crate::feature::Network;

// ── Link quality bands ────────────────────────────────────────────────────────

/// Link quality derived from SNR. Band edges are inclusive on the upper
/// end: exactly 8 dB is Excellent, exactly 5 dB is Good, exactly 0 dB is
/// Marginal, exactly -10 dB is Poor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkQuality {
    Excellent,
    Good,
    Marginal,
    Poor,
    Bad,
    Unknown,
}

impl LinkQuality {
    pub fn from_snr(snr: Option<f64>) -> Self {
        match snr {
            None => LinkQuality::Unknown,
            Some(s) if s >= 8.0 => LinkQuality::Excellent,
            Some(s) if s >= 5.0 => LinkQuality::Good,
            Some(s) if s >= 0.0 => LinkQuality::Marginal,
            Some(s) if s >= -10.0 => LinkQuality::Poor,
            Some(_) => LinkQuality::Bad,
        }
    }

    /// Map rendering colour for this band.
    pub fn color(&self) -> &'static str {
        match self {
            LinkQuality::Excellent => "#2ecc40",
            LinkQuality::Good => "#94e864",
            LinkQuality::Marginal => "#ffdc00",
            LinkQuality::Poor => "#ff851b",
            LinkQuality::Bad => "#ff4136",
            LinkQuality::Unknown => "#aaaaaa",
        }
    }
}

// ── Topology link ─────────────────────────────────────────────────────────────

/// A directed radio edge between two node ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyLink {
    pub source: String,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snr: Option<f64>,
    pub quality: LinkQuality,
    /// Hex colour derived from `quality` (duplicated for map clients).
    pub color: String,
    pub network: Network,
    /// AREDN link class (RF, DTD, TUN, XLINK); absent on other networks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
}

impl TopologyLink {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        snr: Option<f64>,
        network: Network,
    ) -> Self {
        let quality = LinkQuality::from_snr(snr);
        Self {
            source: source.into(),
            target: target.into(),
            snr,
            quality,
            color: quality.color().to_string(),
            network,
            link_type: None,
        }
    }

    pub fn with_link_type(mut self, link_type: impl Into<String>) -> Self {
        self.link_type = Some(link_type.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snr_band_edges_are_inclusive() {
        assert_eq!(LinkQuality::from_snr(Some(8.0)), LinkQuality::Excellent);
        assert_eq!(LinkQuality::from_snr(Some(7.999)), LinkQuality::Good);
        assert_eq!(LinkQuality::from_snr(Some(5.0)), LinkQuality::Good);
        assert_eq!(LinkQuality::from_snr(Some(0.0)), LinkQuality::Marginal);
        assert_eq!(LinkQuality::from_snr(Some(-0.001)), LinkQuality::Poor);
        assert_eq!(LinkQuality::from_snr(Some(-10.0)), LinkQuality::Poor);
        assert_eq!(LinkQuality::from_snr(Some(-10.5)), LinkQuality::Bad);
        assert_eq!(LinkQuality::from_snr(None), LinkQuality::Unknown);
    }

    #[test]
    fn link_derives_colour_from_quality() {
        let link = TopologyLink::new("aa", "bb", Some(9.0), Network::Meshtastic);
        assert_eq!(link.quality, LinkQuality::Excellent);
        assert_eq!(link.color, LinkQuality::Excellent.color());
    }
}
