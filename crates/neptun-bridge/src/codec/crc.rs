//! CRC16-CCITT (polynomial 0x1021, init 0xFFFF, MSB-first, no final XOR)

const POLYNOMIAL: u16 = 0x1021;
const INITIAL: u16 = 0xFFFF;

/// Compute the frame trailer checksum over `data`.
pub fn crc16_ccitt(data: &[u8]) -> u16 {
    let mut crc = INITIAL;
    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ POLYNOMIAL
            } else {
                crc << 1
            };
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_value() {
        assert_eq!(crc16_ccitt(b"123456789"), 0x29B1);
    }

    #[test]
    fn test_empty_input_is_initial_value() {
        assert_eq!(crc16_ccitt(&[]), 0xFFFF);
    }

    #[test]
    fn test_single_bit_flip_changes_crc() {
        let a = crc16_ccitt(&[0x02, 0x54, 0x51, 0x57]);
        let b = crc16_ccitt(&[0x02, 0x54, 0x51, 0x56]);
        assert_ne!(a, b);
    }
}
