//! Device and process-group context.
//!
//! The device is resolved once by [`RuntimeContext::initialize`]; calling it
//! again is an error, [`RuntimeContext::ensure_initialized`] is the
//! idempotent form. Data-parallel rank/world size are recorded for an
//! external launcher, nothing here spawns processes.

use candle_core::Device;

use crate::config::RuntimeConfig;
use crate::error::{Result, ThinkChatError};

/// Parsed device selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRequest {
    /// First CUDA device when available, CPU otherwise.
    Auto,
    Cpu,
    Cuda(usize),
}

impl DeviceRequest {
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "auto" | "" => Ok(DeviceRequest::Auto),
            "cpu" => Ok(DeviceRequest::Cpu),
            "cuda" => Ok(DeviceRequest::Cuda(0)),
            other => {
                let ordinal = other
                    .strip_prefix("cuda:")
                    .and_then(|n| n.parse::<usize>().ok())
                    .ok_or_else(|| {
                        ThinkChatError::InvalidConfig(format!(
                            "unknown device '{}', expected auto, cpu or cuda:N",
                            other
                        ))
                    })?;
                Ok(DeviceRequest::Cuda(ordinal))
            }
        }
    }

    fn resolve(self) -> Result<Device> {
        match self {
            DeviceRequest::Cpu => Ok(Device::Cpu),
            DeviceRequest::Cuda(ordinal) => Ok(Device::new_cuda(ordinal)?),
            DeviceRequest::Auto => Ok(Device::cuda_if_available(0)?),
        }
    }
}

/// Explicit replacement for ambient device state.
#[derive(Debug)]
pub struct RuntimeContext {
    request: DeviceRequest,
    device: Option<Device>,
    pub world_size: usize,
    pub rank: usize,
    pub seed: u64,
}

impl RuntimeContext {
    pub fn new(config: &RuntimeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            request: DeviceRequest::parse(&config.device)?,
            device: None,
            world_size: config.world_size,
            rank: config.rank,
            seed: config.seed,
        })
    }

    /// Single-process CPU context, already initialized.
    pub fn cpu() -> Self {
        Self {
            request: DeviceRequest::Cpu,
            device: Some(Device::Cpu),
            world_size: 1,
            rank: 0,
            seed: 0,
        }
    }

    /// Resolve the device. Fails if called twice.
    pub fn initialize(&mut self) -> Result<&Device> {
        if self.device.is_some() {
            return Err(ThinkChatError::InvalidConfig(
                "runtime context already initialized".into(),
            ));
        }
        self.ensure_initialized()
    }

    pub fn ensure_initialized(&mut self) -> Result<&Device> {
        if self.device.is_none() {
            let device = self.request.resolve()?;
            tracing::info!(
                device = ?device,
                rank = self.rank,
                world_size = self.world_size,
                "runtime initialized"
            );
            self.device = Some(device);
        }
        self.device()
    }

    pub fn device(&self) -> Result<&Device> {
        self.device
            .as_ref()
            .ok_or_else(|| ThinkChatError::not_initialized("runtime device"))
    }

    pub fn is_initialized(&self) -> bool {
        self.device.is_some()
    }

    pub fn is_main_process(&self) -> bool {
        self.rank == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device() {
        assert_eq!(DeviceRequest::parse("auto").unwrap(), DeviceRequest::Auto);
        assert_eq!(DeviceRequest::parse("CPU").unwrap(), DeviceRequest::Cpu);
        assert_eq!(
            DeviceRequest::parse("cuda:3").unwrap(),
            DeviceRequest::Cuda(3)
        );
        assert!(DeviceRequest::parse("tpu").is_err());
        assert!(DeviceRequest::parse("cuda:x").is_err());
    }

    #[test]
    fn test_device_before_init() {
        let cfg = RuntimeConfig {
            device: "cpu".into(),
            ..Default::default()
        };
        let ctx = RuntimeContext::new(&cfg).unwrap();
        assert!(ctx.device().unwrap_err().is_not_initialized());
    }

    #[test]
    fn test_double_initialize_rejected() {
        let cfg = RuntimeConfig {
            device: "cpu".into(),
            ..Default::default()
        };
        let mut ctx = RuntimeContext::new(&cfg).unwrap();
        assert!(ctx.initialize().is_ok());
        assert!(matches!(
            ctx.initialize(),
            Err(ThinkChatError::InvalidConfig(_))
        ));
        assert!(ctx.ensure_initialized().is_ok());
        assert!(ctx.is_main_process());
    }

    #[test]
    fn test_rank_out_of_range() {
        let cfg = RuntimeConfig {
            world_size: 2,
            rank: 2,
            ..Default::default()
        };
        assert!(RuntimeContext::new(&cfg).is_err());
    }
}
