// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

pub const CODEC_BYTES_LIMIT: usize = 1_000_000;

#[inline]
fn config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_little_endian()
        .with_variable_int_encoding()
        .with_limit::<CODEC_BYTES_LIMIT>()
}

pub fn encode_to_vec<T: bincode::Encode>(val: &T) -> Result<Vec<u8>, bincode::error::EncodeError> {
    bincode::encode_to_vec(val, config())
}

pub fn decode<T: bincode::Decode>(bytes: &[u8]) -> Result<T, bincode::error::DecodeError> {
    bincode::decode_from_slice(bytes, config()).map(|r| r.0)
}

/// Returns the number of bytes `val` occupies once encoded.
pub fn encoded_len<T: bincode::Encode>(val: &T) -> Result<usize, bincode::error::EncodeError> {
    encode_to_vec(val).map(|bytes| bytes.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bincode::{Decode, Encode};

    #[derive(Encode, Decode, Debug, PartialEq)]
    enum TestEnum {
        A(u32),
        B(u32),
    }

    #[test]
    fn test_single_byte_enum_variant() {
        let encoded = encode_to_vec(&TestEnum::B(0)).unwrap();
        assert_eq!(encoded.as_slice(), &[1, 0]);
    }

    #[test]
    fn test_fixed_array_has_no_length_prefix() {
        let encoded = encode_to_vec(&[0xffu8; 4]).unwrap();
        assert_eq!(encoded.as_slice(), &[0xff, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn test_vec_has_varint_length_prefix() {
        let input: Vec<u8> = vec![0xff, 0xff];
        let encoded = encode_to_vec(&input).unwrap();
        assert_eq!(encoded.as_slice(), &[0x02, 0xff, 0xff]);
    }

    #[test]
    fn encoded_len_matches_encoding() {
        let val = (TestEnum::A(300), vec![1u8; 17], 12_000_u64);
        let encoded = encode_to_vec(&val).unwrap();
        assert_eq!(encoded_len(&val).unwrap(), encoded.len());
    }

    #[test]
    fn decode_rejects_oversized_payload() {
        let mut bytes = vec![0xfd];
        bytes.extend_from_slice(&((CODEC_BYTES_LIMIT as u64) * 2).to_le_bytes());
        assert!(decode::<Vec<u8>>(&bytes).is_err());
    }
}
