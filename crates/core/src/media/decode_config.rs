//! Decoder configuration derived from H.264 parameter sets.
//!
//! The receiver keeps the latest SPS and PPS it has seen. Whenever either
//! input changes, the configuration is recomputed; it is only handed
//! upward when the recomputed value differs from the previous one.

use base64::prelude::{BASE64_STANDARD, Engine as _};

use super::nal::{NalUnit, NalUnitType};

/// Which parameter set an update touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterSetChange {
    Sps,
    Pps,
}

/// Everything a decoder needs before it can accept slices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeConfiguration {
    /// SPS NAL unit, header byte included.
    pub sps: Vec<u8>,
    /// PPS NAL unit, header byte included.
    pub pps: Vec<u8>,
}

impl DecodeConfiguration {
    /// profile-level-id (RFC 6184 §8.1): SPS bytes 1–3 are profile_idc,
    /// constraint flags and level_idc.
    pub fn profile_level_id(&self) -> Option<String> {
        self.sps
            .get(1..4)
            .map(|b| format!("{:02x}{:02x}{:02x}", b[0], b[1], b[2]))
    }

    /// `sprop-parameter-sets` value: base64 SPS and PPS, comma separated.
    pub fn sprop_parameter_sets(&self) -> String {
        format!(
            "{},{}",
            BASE64_STANDARD.encode(&self.sps),
            BASE64_STANDARD.encode(&self.pps)
        )
    }

    /// Both parameter sets as an Annex B byte stream.
    pub fn to_annex_b(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.sps.len() + self.pps.len());
        for set in [&self.sps, &self.pps] {
            out.extend_from_slice(&[0, 0, 0, 1]);
            out.extend_from_slice(set);
        }
        out
    }
}

/// Latest SPS/PPS seen on a stream and the configuration derived from them.
#[derive(Debug, Default)]
pub struct ParameterSets {
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
    current: Option<DecodeConfiguration>,
}

impl ParameterSets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `unit` if it is a parameter set that differs from the stored one.
    pub fn apply(&mut self, unit: &NalUnit<'_>) -> Option<ParameterSetChange> {
        let (slot, change) = match unit.unit_type() {
            NalUnitType::Sps => (&mut self.sps, ParameterSetChange::Sps),
            NalUnitType::Pps => (&mut self.pps, ParameterSetChange::Pps),
            _ => return None,
        };

        let bytes = unit.to_bytes();
        if slot.as_deref() == Some(bytes.as_slice()) {
            return None;
        }

        tracing::debug!(?change, size = bytes.len(), "parameter set updated");
        *slot = Some(bytes);
        Some(change)
    }

    /// Rebuild the derived configuration after an input changed.
    ///
    /// Returns the new configuration only when it differs from the last one.
    pub fn recompute(&mut self, change: ParameterSetChange) -> Option<&DecodeConfiguration> {
        let (Some(sps), Some(pps)) = (&self.sps, &self.pps) else {
            tracing::trace!(?change, "waiting for the other parameter set");
            return None;
        };

        let next = DecodeConfiguration {
            sps: sps.clone(),
            pps: pps.clone(),
        };
        if self.current.as_ref() == Some(&next) {
            return None;
        }

        self.current = Some(next);
        self.current.as_ref()
    }

    pub fn configuration(&self) -> Option<&DecodeConfiguration> {
        self.current.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPS: [u8; 4] = [0x67, 0x42, 0x00, 0x1e];
    const PPS: [u8; 4] = [0x68, 0xce, 0x38, 0x80];

    fn unit(bytes: &[u8]) -> NalUnit<'_> {
        NalUnit::parse(bytes).unwrap()
    }

    #[test]
    fn configuration_needs_both_sets() {
        let mut ps = ParameterSets::new();
        let change = ps.apply(&unit(&SPS)).unwrap();
        assert!(ps.recompute(change).is_none());

        let change = ps.apply(&unit(&PPS)).unwrap();
        let config = ps.recompute(change).unwrap();
        assert_eq!(config.sps, SPS);
        assert_eq!(config.pps, PPS);
    }

    #[test]
    fn repeated_sets_are_not_changes() {
        let mut ps = ParameterSets::new();
        ps.apply(&unit(&SPS));
        let change = ps.apply(&unit(&PPS)).unwrap();
        ps.recompute(change);

        assert!(ps.apply(&unit(&SPS)).is_none());
        assert!(ps.apply(&unit(&PPS)).is_none());
    }

    #[test]
    fn new_sps_produces_new_configuration() {
        let mut ps = ParameterSets::new();
        ps.apply(&unit(&SPS));
        let change = ps.apply(&unit(&PPS)).unwrap();
        ps.recompute(change);

        let sps2 = [0x67, 0x64, 0x00, 0x28];
        let change = ps.apply(&unit(&sps2)).unwrap();
        assert_eq!(change, ParameterSetChange::Sps);
        let config = ps.recompute(change).unwrap();
        assert_eq!(config.profile_level_id().as_deref(), Some("640028"));
    }

    #[test]
    fn non_parameter_units_ignored() {
        let mut ps = ParameterSets::new();
        assert!(ps.apply(&unit(&[0x65, 0x88])).is_none());
        assert!(ps.configuration().is_none());
    }

    #[test]
    fn derived_fields() {
        let config = DecodeConfiguration {
            sps: SPS.to_vec(),
            pps: PPS.to_vec(),
        };
        assert_eq!(config.profile_level_id().as_deref(), Some("42001e"));
        assert_eq!(config.sprop_parameter_sets(), "Z0IAHg==,aM44gA==");
        let mut annex_b = vec![0u8, 0, 0, 1];
        annex_b.extend_from_slice(&SPS);
        annex_b.extend_from_slice(&[0, 0, 0, 1]);
        annex_b.extend_from_slice(&PPS);
        assert_eq!(config.to_annex_b(), annex_b);
    }

    #[test]
    fn short_sps_has_no_profile() {
        let config = DecodeConfiguration {
            sps: vec![0x67, 0x42],
            pps: PPS.to_vec(),
        };
        assert!(config.profile_level_id().is_none());
    }
}
