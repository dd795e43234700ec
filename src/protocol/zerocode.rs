//! Zero-run coding: every run of zero bytes is replaced by a single
//! zero followed by the run length (at most 255 per pair).

use super::DecodeError;

/// Appends the zero-run coded form of `data` to `out`.
pub fn encode(data: &[u8], out: &mut Vec<u8>) {
    let mut run = 0u8;
    for &byte in data {
        if byte == 0 {
            if run == u8::MAX {
                out.extend([0, run]);
                run = 0;
            }
            run += 1;
        } else {
            if run != 0 {
                out.extend([0, run]);
                run = 0;
            }
            out.push(byte);
        }
    }
    if run != 0 {
        out.extend([0, run]);
    }
}

/// Expands zero-run coded `data`.
pub fn decode(data: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut out = Vec::with_capacity(data.len() * 2);
    let mut bytes = data.iter();
    while let Some(&byte) = bytes.next() {
        if byte == 0 {
            let &count = bytes.next().ok_or(DecodeError::TruncatedZeroRun)?;
            out.resize(out.len() + usize::from(count), 0);
        } else {
            out.push(byte);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_runs() {
        let mut out = Vec::new();
        encode(&[0xFF, 0xFF, 0, 0, 0, 3, 0, 7], &mut out);
        assert_eq!(out, [0xFF, 0xFF, 0, 3, 3, 0, 1, 7]);
        assert_eq!(decode(&out).unwrap(), [0xFF, 0xFF, 0, 0, 0, 3, 0, 7]);
    }

    #[test]
    fn splits_long_runs() {
        let data = vec![0u8; 300];
        let mut out = Vec::new();
        encode(&data, &mut out);
        assert_eq!(out, [0, 255, 0, 45]);
        assert_eq!(decode(&out).unwrap(), data);
    }

    #[test]
    fn exactly_255_zeros() {
        let data = vec![0u8; 255];
        let mut out = Vec::new();
        encode(&data, &mut out);
        assert_eq!(out, [0, 255]);
    }

    #[test]
    fn rejects_truncated_run() {
        assert!(matches!(
            decode(&[5, 0]),
            Err(DecodeError::TruncatedZeroRun)
        ));
    }
}
