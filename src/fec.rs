//! FEC 코덱 - GF(2^8) 체계적 Reed-Solomon 소거 부호
//!
//! 블록 하나는 소스 심볼 `k`개와 패리티 심볼 `p`개로 이루어지고, `k + p`개 중
//! 아무 `k`개만 받으면 나머지 소스 심볼을 복구할 수 있다.
//! 부호화 / 복호화는 `reed-solomon-erasure` 크레이트에 맡긴다.

use std::collections::HashMap;

use reed_solomon_erasure::galois_8::ReedSolomon;

use crate::{Error, Result};

/// 블록당 최대 심볼 수 (소스 + 패리티)
pub const MAX_SYMBOLS: usize = 255;

/// 고정 (k, p) 구성의 Reed-Solomon 코덱
///
/// 패리티가 0개인 구성도 허용한다 (이 경우 손실 복구는 재전송에만 의존).
#[derive(Debug, Clone)]
pub struct RsCodec {
    num_data: usize,
    num_parity: usize,
    rs: Option<ReedSolomon>,
}

impl RsCodec {
    pub fn new(num_data: usize, num_parity: usize) -> Result<Self> {
        let invalid = || Error::InvalidFecGeometry {
            num_data,
            num_parity,
        };
        if num_data == 0 || num_data + num_parity > MAX_SYMBOLS {
            return Err(invalid());
        }

        let rs = match num_parity {
            0 => None,
            _ => Some(ReedSolomon::new(num_data, num_parity).map_err(|_| invalid())?),
        };

        Ok(Self {
            num_data,
            num_parity,
            rs,
        })
    }

    pub fn num_data(&self) -> usize {
        self.num_data
    }

    pub fn num_parity(&self) -> usize {
        self.num_parity
    }

    /// 모든 패리티 심볼 계산
    ///
    /// `source`는 소스 심볼 `num_data`개. 짧은 심볼(객체의 마지막 세그먼트)은
    /// 가장 긴 심볼 길이까지 0으로 채운 것으로 본다.
    pub fn encode<S: AsRef<[u8]>>(&self, source: &[S]) -> Result<Vec<Vec<u8>>> {
        let Some(rs) = &self.rs else {
            return Ok(Vec::new());
        };
        if source.len() != self.num_data {
            return Err(Error::InsufficientSymbols {
                available: source.len(),
                required: self.num_data,
            });
        }

        let len = source.iter().map(|s| s.as_ref().len()).max().unwrap_or(0);
        let padded: Vec<Vec<u8>> = source
            .iter()
            .map(|s| {
                let mut data = s.as_ref().to_vec();
                data.resize(len, 0);
                data
            })
            .collect();
        let mut parity = vec![vec![0u8; len]; self.num_parity];
        rs.encode_sep(&padded, &mut parity)?;
        Ok(parity)
    }

    /// 누락된 소스 심볼 복구
    ///
    /// `symbols[0..k]`는 소스, `symbols[k..k+p]`는 패리티. 존재하는 심볼이 `k`개
    /// 이상이면 모든 `None` 소스 슬롯을 채운다. 패리티 슬롯은 건드리지 않는다.
    pub fn reconstruct(&self, symbols: &mut [Option<Vec<u8>>]) -> Result<()> {
        let total = self.num_data + self.num_parity;
        let missing = (0..self.num_data).any(|i| !matches!(symbols.get(i), Some(Some(_))));
        if !missing {
            return Ok(());
        }

        let available = symbols.iter().take(total).filter(|s| s.is_some()).count();
        let rs = match &self.rs {
            Some(rs) if available >= self.num_data => rs,
            _ => {
                return Err(Error::InsufficientSymbols {
                    available,
                    required: self.num_data,
                })
            }
        };

        // 크레이트는 k + p개 슬롯과 같은 길이의 심볼을 요구한다
        let len = symbols.iter().flatten().map(Vec::len).max().unwrap_or(0);
        let mut shards: Vec<Option<Vec<u8>>> = (0..total)
            .map(|i| {
                symbols.get(i).cloned().flatten().map(|mut s| {
                    s.resize(len, 0);
                    s
                })
            })
            .collect();
        rs.reconstruct_data(&mut shards)?;

        for (slot, shard) in symbols.iter_mut().zip(shards).take(self.num_data) {
            if slot.is_none() {
                *slot = shard;
            }
        }
        Ok(())
    }
}

/// 블록 길이별 코덱 캐시
///
/// 객체의 마지막 블록은 소스 심볼 수가 적으므로 별도 코덱이 필요하다.
#[derive(Debug)]
pub struct CodecCache {
    num_parity: usize,
    codecs: HashMap<usize, RsCodec>,
}

impl CodecCache {
    pub fn new(num_parity: usize) -> Self {
        Self {
            num_parity,
            codecs: HashMap::new(),
        }
    }

    pub fn num_parity(&self) -> usize {
        self.num_parity
    }

    pub fn get(&mut self, num_data: usize) -> Result<&RsCodec> {
        if !self.codecs.contains_key(&num_data) {
            let codec = RsCodec::new(num_data, self.num_parity)?;
            self.codecs.insert(num_data, codec);
        }
        self.codecs
            .get(&num_data)
            .ok_or(Error::InvalidFecGeometry {
                num_data,
                num_parity: self.num_parity,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};

    fn random_block(rng: &mut impl Rng, k: usize, len: usize) -> Vec<Vec<u8>> {
        (0..k)
            .map(|_| (0..len).map(|_| rng.gen()).collect())
            .collect()
    }

    #[test]
    fn test_single_erasure_from_first_parity() {
        let codec = RsCodec::new(4, 2).unwrap();
        let source = vec![vec![1u8, 2], vec![3, 4], vec![5, 6], vec![7, 8]];
        let parity = codec.encode(&source).unwrap();
        assert_eq!(parity.len(), 2);

        let mut symbols: Vec<Option<Vec<u8>>> = source.iter().cloned().map(Some).collect();
        symbols.extend(parity.into_iter().map(Some));
        symbols[0] = None;
        codec.reconstruct(&mut symbols).unwrap();
        assert_eq!(symbols[0].as_deref(), Some(&[1u8, 2][..]));
    }

    #[test]
    fn test_any_k_of_k_plus_p_recovers() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let (k, p, len) = (16, 6, 64);
        let codec = RsCodec::new(k, p).unwrap();
        let source = random_block(&mut rng, k, len);
        let parity = codec.encode(&source).unwrap();

        for _ in 0..50 {
            let mut positions: Vec<usize> = (0..k + p).collect();
            positions.shuffle(&mut rng);
            let keep: Vec<usize> = positions.into_iter().take(k).collect();

            let mut symbols: Vec<Option<Vec<u8>>> = (0..k + p)
                .map(|i| {
                    if !keep.contains(&i) {
                        None
                    } else if i < k {
                        Some(source[i].clone())
                    } else {
                        Some(parity[i - k].clone())
                    }
                })
                .collect();

            codec.reconstruct(&mut symbols).unwrap();
            for i in 0..k {
                assert_eq!(symbols[i].as_ref().unwrap(), &source[i]);
            }
        }
    }

    #[test]
    fn test_all_parity_used() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(11);
        let (k, p) = (8, 8);
        let codec = RsCodec::new(k, p).unwrap();
        let source = random_block(&mut rng, k, 32);
        let parity = codec.encode(&source).unwrap();

        let mut symbols: Vec<Option<Vec<u8>>> = vec![None; k];
        symbols.extend(parity.into_iter().map(Some));
        codec.reconstruct(&mut symbols).unwrap();
        for i in 0..k {
            assert_eq!(symbols[i].as_ref().unwrap(), &source[i]);
        }
    }

    #[test]
    fn test_insufficient_symbols() {
        let codec = RsCodec::new(4, 2).unwrap();
        let mut symbols = vec![Some(vec![0u8; 4]), None, None, None, Some(vec![1u8; 4]), None];
        assert!(matches!(
            codec.reconstruct(&mut symbols),
            Err(Error::InsufficientSymbols {
                available: 2,
                required: 4
            })
        ));
    }

    #[test]
    fn test_short_last_symbol_is_zero_padded() {
        let codec = RsCodec::new(3, 1).unwrap();
        let source = vec![vec![1u8; 8], vec![2u8; 8], vec![3u8; 5]];
        let parity = codec.encode(&source).unwrap();
        assert_eq!(parity[0].len(), 8);

        let mut symbols = vec![Some(source[0].clone()), None, Some(source[2].clone()), Some(parity[0].clone())];
        codec.reconstruct(&mut symbols).unwrap();
        assert_eq!(symbols[1].as_deref(), Some(&[2u8; 8][..]));
    }

    #[test]
    fn test_no_parity() {
        let codec = RsCodec::new(4, 0).unwrap();
        assert!(codec.encode(&[[0u8; 4]; 4]).unwrap().is_empty());

        let mut symbols = vec![Some(vec![0u8; 4]), None, Some(vec![0u8; 4]), Some(vec![0u8; 4])];
        assert!(matches!(
            codec.reconstruct(&mut symbols),
            Err(Error::InsufficientSymbols {
                available: 3,
                required: 4
            })
        ));
    }

    #[test]
    fn test_invalid_geometry() {
        assert!(RsCodec::new(0, 4).is_err());
        assert!(RsCodec::new(200, 56).is_err());
        assert!(RsCodec::new(200, 55).is_ok());
    }

    #[test]
    fn test_codec_cache_short_block() {
        let mut cache = CodecCache::new(4);
        assert_eq!(cache.get(64).unwrap().num_data(), 64);
        assert_eq!(cache.get(3).unwrap().num_data(), 3);
        assert_eq!(cache.get(3).unwrap().num_parity(), 4);
    }
}
