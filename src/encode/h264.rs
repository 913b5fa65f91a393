//! H.264 bitstream helpers
//!
//! Encoders hand out Annex B (start-code delimited) NAL units; Matroska's
//! `V_MPEG4/ISO/AVC` wants length-prefixed NAL units plus an
//! AVCDecoderConfigurationRecord as codec private data.

/// NAL unit types used here
pub mod nal_type {
    pub const NON_IDR_SLICE: u8 = 1;
    pub const IDR_SLICE: u8 = 5;
    pub const SPS: u8 = 7;
    pub const PPS: u8 = 8;
    pub const AUD: u8 = 9;
}

/// Split Annex B data on 3- and 4-byte start codes
pub fn split_annex_b(data: &[u8]) -> Vec<&[u8]> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            starts.push((i, i + 3));
            i += 3;
        } else {
            i += 1;
        }
    }

    let mut nals = Vec::with_capacity(starts.len());
    for (idx, &(_, begin)) in starts.iter().enumerate() {
        let mut end = match starts.get(idx + 1) {
            Some(&(code_at, _)) => code_at,
            None => data.len(),
        };
        // The zero of a 4-byte start code belongs to the next code
        while end > begin && data[end - 1] == 0 {
            end -= 1;
        }
        if end > begin {
            nals.push(&data[begin..end]);
        }
    }
    nals
}

pub fn nal_unit_type(nal: &[u8]) -> u8 {
    nal.first().map(|b| b & 0x1F).unwrap_or(0)
}

/// Check if data looks like Annex B rather than length-prefixed
pub fn is_annex_b(data: &[u8]) -> bool {
    data.starts_with(&[0, 0, 1]) || data.starts_with(&[0, 0, 0, 1])
}

/// Convert an Annex B access unit to 4-byte length-prefixed NAL units.
/// Parameter sets and delimiters are dropped; they live in codec private.
pub fn annex_b_to_avcc(data: &[u8]) -> Vec<u8> {
    let nals = split_annex_b(data);
    let mut out = Vec::with_capacity(data.len() + nals.len() * 4);
    for nal in nals {
        match nal_unit_type(nal) {
            nal_type::SPS | nal_type::PPS | nal_type::AUD => continue,
            _ => {
                out.extend_from_slice(&(nal.len() as u32).to_be_bytes());
                out.extend_from_slice(nal);
            }
        }
    }
    out
}

/// Check if an Annex B access unit holds an IDR slice
pub fn contains_idr(data: &[u8]) -> bool {
    split_annex_b(data)
        .iter()
        .any(|nal| nal_unit_type(nal) == nal_type::IDR_SLICE)
}

/// Build an AVCDecoderConfigurationRecord from one SPS and one PPS
pub fn decoder_config_record(sps: &[u8], pps: &[u8]) -> Vec<u8> {
    let mut record = Vec::with_capacity(11 + sps.len() + pps.len());
    record.push(1); // configurationVersion
    if sps.len() >= 4 {
        record.extend_from_slice(&sps[1..4]); // profile, compatibility, level
    } else {
        record.extend_from_slice(&[0x64, 0x00, 0x1f]);
    }
    record.push(0xFF); // 4-byte NAL lengths
    record.push(0xE1); // one SPS
    record.extend_from_slice(&(sps.len() as u16).to_be_bytes());
    record.extend_from_slice(sps);
    record.push(1); // one PPS
    record.extend_from_slice(&(pps.len() as u16).to_be_bytes());
    record.extend_from_slice(pps);
    record
}

/// Turn encoder extradata into codec private data. Extradata that is
/// already a configuration record passes through.
pub fn codec_private_from_extradata(extradata: &[u8]) -> Option<Vec<u8>> {
    if extradata.first() == Some(&1) {
        return Some(extradata.to_vec());
    }
    let nals = split_annex_b(extradata);
    let sps = nals.iter().find(|n| nal_unit_type(n) == nal_type::SPS)?;
    let pps = nals.iter().find(|n| nal_unit_type(n) == nal_type::PPS)?;
    Some(decoder_config_record(sps, pps))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPS: [u8; 5] = [0x67, 0x64, 0x00, 0x1f, 0xAC];
    const PPS: [u8; 3] = [0x68, 0xEE, 0x3C];

    fn annex_b(nals: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for (i, nal) in nals.iter().enumerate() {
            if i % 2 == 0 {
                out.extend_from_slice(&[0, 0, 0, 1]);
            } else {
                out.extend_from_slice(&[0, 0, 1]);
            }
            out.extend_from_slice(nal);
        }
        out
    }

    #[test]
    fn test_split_mixed_start_codes() {
        let idr = [0x65, 0x88, 0x84];
        let data = annex_b(&[&SPS, &PPS, &idr]);
        let nals = split_annex_b(&data);
        assert_eq!(nals, vec![&SPS[..], &PPS[..], &idr[..]]);
        assert!(contains_idr(&data));
        assert!(is_annex_b(&data));
    }

    #[test]
    fn test_avcc_conversion_drops_parameter_sets() {
        let slice = [0x41, 0x9A, 0x02];
        let data = annex_b(&[&SPS, &PPS, &slice]);
        let avcc = annex_b_to_avcc(&data);
        assert_eq!(avcc, vec![0, 0, 0, 3, 0x41, 0x9A, 0x02]);
        assert!(!contains_idr(&data));
    }

    #[test]
    fn test_codec_private_from_annex_b() {
        let extradata = annex_b(&[&SPS, &PPS]);
        let record = codec_private_from_extradata(&extradata).unwrap();
        assert_eq!(&record[..5], &[1, 0x64, 0x00, 0x1f, 0xFF]);
        assert_eq!(record[5], 0xE1);
        assert_eq!(&record[6..8], &(SPS.len() as u16).to_be_bytes());
        assert_eq!(&record[8..13], &SPS);
        assert_eq!(record[13], 1);

        // Already a record
        assert_eq!(codec_private_from_extradata(&record), Some(record.clone()));
        assert_eq!(codec_private_from_extradata(&annex_b(&[&PPS])), None);
    }
}
