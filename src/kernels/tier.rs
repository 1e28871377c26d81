use std::fmt;
use std::sync::OnceLock;
/// Instruction-set tier a kernel family is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Scalar,
    Avx2,
    Neon,
}
impl Tier {
    /// Best tier supported by the running CPU, detected once.
    pub fn detect() -> Tier {
        static DETECTED: OnceLock<Tier> = OnceLock::new();
        *DETECTED.get_or_init(|| {
            let tier = [Tier::Avx2, Tier::Neon]
                .into_iter()
                .find(|t| t.is_available())
                .unwrap_or(Tier::Scalar);
            log::debug!("detected kernel tier {tier}");
            tier
        })
    }
    pub fn is_available(self) -> bool {
        match self {
            Tier::Scalar => true,
            Tier::Avx2 => {
                #[cfg(target_arch = "x86_64")]
                {
                    is_x86_feature_detected!("avx2")
                }
                #[cfg(not(target_arch = "x86_64"))]
                {
                    false
                }
            }
            Tier::Neon => {
                #[cfg(target_arch = "aarch64")]
                {
                    std::arch::is_aarch64_feature_detected!("neon")
                }
                #[cfg(not(target_arch = "aarch64"))]
                {
                    false
                }
            }
        }
    }
    /// All tiers usable on this machine, scalar first.
    pub fn available() -> Vec<Tier> {
        [Tier::Scalar, Tier::Avx2, Tier::Neon]
            .into_iter()
            .filter(|t| t.is_available())
            .collect()
    }
    pub fn name(self) -> &'static str {
        match self {
            Tier::Scalar => "Scalar",
            Tier::Avx2 => "Avx2",
            Tier::Neon => "Neon",
        }
    }
}
impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
