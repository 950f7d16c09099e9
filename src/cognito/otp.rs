use std::sync::atomic::{AtomicU32, Ordering};

/// Six-digit one-time code source. Random by default; deterministic mode
/// hands out a predictable ascending sequence so tests and local scripts
/// can complete code flows without reading the delivery log.
pub struct OtpService {
    deterministic: Option<AtomicU32>,
}

impl OtpService {
    pub fn random() -> Self {
        OtpService {
            deterministic: None,
        }
    }

    pub fn deterministic() -> Self {
        OtpService {
            deterministic: Some(AtomicU32::new(123456)),
        }
    }

    pub fn generate(&self) -> String {
        match &self.deterministic {
            Some(counter) => {
                let code = counter.fetch_add(1, Ordering::SeqCst) % 1_000_000;
                format!("{code:06}")
            }
            None => {
                use rand::Rng;
                format!("{:06}", rand::thread_rng().gen_range(0..1_000_000u32))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_codes_ascend() {
        let otp = OtpService::deterministic();
        assert_eq!(otp.generate(), "123456");
        assert_eq!(otp.generate(), "123457");
    }

    #[test]
    fn random_codes_are_six_digits() {
        let otp = OtpService::random();
        for _ in 0..32 {
            let code = otp.generate();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }
}
