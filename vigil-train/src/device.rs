//! Device resolution and placement.
//!
//! Turns textual device fields (`"cpu"`, `"cuda"`, `"cuda:1,cuda:3"`,
//! `"cuda:all"`) into a [`DeviceAssignment`], and routes models and tensors to
//! the concrete target it describes.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::executor::Phase;
use vigil_core::{ConfigError, ResourceError, Result, TrainerConfig};

/// Environment variable holding an explicit accelerator count.
pub const ACCELERATOR_COUNT_VAR: &str = "VIGIL_ACCELERATORS";
/// Environment variable listing visible accelerators (comma-separated).
pub const VISIBLE_DEVICES_VAR: &str = "CUDA_VISIBLE_DEVICES";

/// Reports how many accelerators the process can use.
pub trait AcceleratorProbe: Send + Sync {
    fn device_count(&self) -> usize;
}

/// Fixed accelerator count, for tests and explicit overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticProbe(pub usize);

impl AcceleratorProbe for StaticProbe {
    fn device_count(&self) -> usize {
        self.0
    }
}

/// Reads the accelerator count from the environment.
///
/// `VIGIL_ACCELERATORS` (a number) wins; otherwise the entries of
/// `CUDA_VISIBLE_DEVICES` are counted. Neither set means no accelerators.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvProbe;

impl AcceleratorProbe for EnvProbe {
    fn device_count(&self) -> usize {
        if let Ok(count) = std::env::var(ACCELERATOR_COUNT_VAR) {
            return count.trim().parse().unwrap_or(0);
        }
        std::env::var(VISIBLE_DEVICES_VAR)
            .map(|list| count_visible(&list))
            .unwrap_or(0)
    }
}

fn count_visible(list: &str) -> usize {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty() && *entry != "-1")
        .count()
}

/// A resolved compute target for one phase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "devices", rename_all = "snake_case")]
pub enum DeviceAssignment {
    Cpu,
    Single(usize),
    Multi(Vec<usize>),
    /// Every accelerator the probe reports.
    All,
}

impl DeviceAssignment {
    pub fn is_cpu(&self) -> bool {
        matches!(self, Self::Cpu)
    }

    pub fn is_multi(&self) -> bool {
        matches!(self, Self::Multi(_) | Self::All)
    }
}

impl fmt::Display for DeviceAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Single(idx) => write!(f, "cuda:{idx}"),
            Self::Multi(idxs) => {
                let parts: Vec<String> = idxs.iter().map(|i| format!("cuda:{i}")).collect();
                write!(f, "{}", parts.join(","))
            }
            Self::All => write!(f, "cuda:all"),
        }
    }
}

/// One concrete compute device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Device {
    Cpu,
    Accelerator(usize),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Accelerator(idx) => write!(f, "cuda:{idx}"),
        }
    }
}

/// Where an uploaded object actually lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Placement {
    /// Placed directly on one device.
    Single(Device),
    /// Replicated across accelerators; batches are scattered from the first.
    Replicated(Vec<usize>),
}

impl Placement {
    /// Device that receives tensors before any fan-out.
    pub fn primary(&self) -> Device {
        match self {
            Self::Single(device) => *device,
            Self::Replicated(idxs) => idxs
                .first()
                .map_or(Device::Cpu, |idx| Device::Accelerator(*idx)),
        }
    }

    /// Every device taking part in this placement.
    pub fn devices(&self) -> Vec<Device> {
        match self {
            Self::Single(device) => vec![*device],
            Self::Replicated(idxs) => idxs.iter().map(|i| Device::Accelerator(*i)).collect(),
        }
    }

    /// Move raw tensor data onto the primary device.
    pub fn upload_tensor(&self, data: Vec<f64>) -> DeviceTensor {
        DeviceTensor {
            device: self.primary(),
            data,
        }
    }
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(device) => write!(f, "{device}"),
            Self::Replicated(idxs) => write!(f, "replicated{idxs:?}"),
        }
    }
}

/// Tensor data tagged with the device it was uploaded to.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceTensor {
    pub device: Device,
    pub data: Vec<f64>,
}

/// Objects that can be moved onto a placement. Host-resident objects keep the
/// default, which accepts any placement.
pub trait Placeable {
    fn place(&mut self, _placement: &Placement) -> Result<()> {
        Ok(())
    }
}

/// Resolves device specifications against the available accelerators.
pub struct DeviceDispatcher {
    probe: Box<dyn AcceleratorProbe>,
}

impl fmt::Debug for DeviceDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceDispatcher")
            .field("accelerators", &self.probe.device_count())
            .finish()
    }
}

impl Default for DeviceDispatcher {
    fn default() -> Self {
        Self::new(Box::new(EnvProbe))
    }
}

impl DeviceDispatcher {
    pub fn new(probe: Box<dyn AcceleratorProbe>) -> Self {
        Self { probe }
    }

    pub fn with_accelerators(count: usize) -> Self {
        Self::new(Box::new(StaticProbe(count)))
    }

    pub fn accelerator_count(&self) -> usize {
        self.probe.device_count()
    }

    /// Specification used for a field left unset: the first accelerator when
    /// one exists, the CPU otherwise.
    pub fn default_spec(&self) -> &'static str {
        if self.accelerator_count() > 0 { "cuda:0" } else { "cpu" }
    }

    /// Resolve an optional field, falling back to [`Self::default_spec`].
    pub fn resolve_or_default(&self, field: &str, spec: Option<&str>) -> Result<DeviceAssignment> {
        match spec.map(str::trim).filter(|s| !s.is_empty()) {
            Some(spec) => self.resolve(field, spec),
            None => self.resolve(field, self.default_spec()),
        }
    }

    /// Resolve a comma-separated device specification for `field`.
    pub fn resolve(&self, field: &str, spec: &str) -> Result<DeviceAssignment> {
        let tokens: Vec<&str> = spec.split(',').map(str::trim).collect();
        let combined = tokens.len() > 1;
        let available = self.accelerator_count();
        let mut indices = Vec::with_capacity(tokens.len());

        for token in &tokens {
            match *token {
                "cpu" => {
                    if combined {
                        return Err(ConfigError::invalid(
                            field,
                            "cannot combine cpu with other devices",
                        )
                        .into());
                    }
                    return Ok(DeviceAssignment::Cpu);
                }
                "cuda" => {
                    if combined {
                        return Err(ConfigError::invalid(
                            field,
                            "must specify device index (e.g. 'cuda:0') if combining devices",
                        )
                        .into());
                    }
                    require_accelerators(field, available)?;
                    return Ok(DeviceAssignment::Single(0));
                }
                "cuda:all" => {
                    if combined {
                        return Err(ConfigError::invalid(
                            field,
                            "use of 'cuda:all' must not be combined with other devices",
                        )
                        .into());
                    }
                    require_accelerators(field, available)?;
                    return Ok(if available == 1 {
                        DeviceAssignment::Single(0)
                    } else {
                        DeviceAssignment::All
                    });
                }
                other => {
                    let index = parse_cuda_index(field, other)?;
                    require_accelerators(field, available)?;
                    if index >= available {
                        return Err(ResourceError::DeviceOutOfRange {
                            field: field.to_string(),
                            index,
                            available,
                        }
                        .into());
                    }
                    if indices.contains(&index) {
                        return Err(ConfigError::invalid(
                            field,
                            format!("device 'cuda:{index}' listed more than once"),
                        )
                        .into());
                    }
                    indices.push(index);
                }
            }
        }

        match indices.as_slice() {
            [single] => Ok(DeviceAssignment::Single(*single)),
            _ => Ok(DeviceAssignment::Multi(indices)),
        }
    }

    /// Concrete placement for an assignment.
    pub fn placement(&self, assignment: &DeviceAssignment) -> Placement {
        match assignment {
            DeviceAssignment::Cpu => Placement::Single(Device::Cpu),
            DeviceAssignment::Single(idx) => Placement::Single(Device::Accelerator(*idx)),
            DeviceAssignment::Multi(idxs) => Placement::Replicated(idxs.clone()),
            DeviceAssignment::All => Placement::Replicated((0..self.accelerator_count()).collect()),
        }
    }

    /// Place a model (or anything placeable) on the assignment's target.
    pub fn upload<T: Placeable + ?Sized>(
        &self,
        target: &mut T,
        assignment: &DeviceAssignment,
    ) -> Result<Placement> {
        let placement = self.placement(assignment);
        target.place(&placement)?;
        Ok(placement)
    }

    /// Move tensor data to the assignment's primary device.
    pub fn upload_tensor(&self, data: Vec<f64>, assignment: &DeviceAssignment) -> DeviceTensor {
        self.placement(assignment).upload_tensor(data)
    }
}

fn require_accelerators(field: &str, available: usize) -> Result<()> {
    if available == 0 {
        return Err(ResourceError::AcceleratorUnavailable {
            field: field.to_string(),
        }
        .into());
    }
    Ok(())
}

fn parse_cuda_index(field: &str, token: &str) -> Result<usize> {
    let unknown = || ConfigError::UnknownDevice {
        field: field.to_string(),
        token: token.to_string(),
    };
    let index = token.strip_prefix("cuda:").ok_or_else(unknown)?;
    index.parse::<usize>().map_err(|_| unknown().into())
}

/// Resolved assignments for the three phases of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseDevices {
    pub train: DeviceAssignment,
    pub valid: DeviceAssignment,
    pub test: DeviceAssignment,
}

impl PhaseDevices {
    /// Resolve `train_device`, `valid_device` and `test_device`. Every field is
    /// resolved, even for phases without data, so a bad field fails early.
    pub fn resolve(dispatcher: &DeviceDispatcher, config: &TrainerConfig) -> Result<Self> {
        let resolve = |phase: Phase| {
            let spec = match phase {
                Phase::Train => config.train_device.as_deref(),
                Phase::Valid => config.valid_device.as_deref(),
                Phase::Test => config.test_device.as_deref(),
            };
            dispatcher.resolve_or_default(phase.device_field(), spec)
        };
        Ok(Self {
            train: resolve(Phase::Train)?,
            valid: resolve(Phase::Valid)?,
            test: resolve(Phase::Test)?,
        })
    }

    pub fn get(&self, phase: Phase) -> &DeviceAssignment {
        match phase {
            Phase::Train => &self.train,
            Phase::Valid => &self.valid,
            Phase::Test => &self.test,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::VigilError;

    fn dispatcher(count: usize) -> DeviceDispatcher {
        DeviceDispatcher::with_accelerators(count)
    }

    #[test]
    fn test_resolve_cpu() {
        assert_eq!(dispatcher(0).resolve("train_device", "cpu").unwrap(), DeviceAssignment::Cpu);
        assert_eq!(dispatcher(4).resolve("train_device", " cpu ").unwrap(), DeviceAssignment::Cpu);
    }

    #[test]
    fn test_cpu_cannot_be_combined() {
        let err = dispatcher(2).resolve("train_device", "cpu,cuda:0").unwrap_err();
        assert!(err.is_config());
        let err = dispatcher(2).resolve("train_device", "cuda:1,cpu").unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_resolve_default_accelerator() {
        assert_eq!(dispatcher(2).resolve("f", "cuda").unwrap(), DeviceAssignment::Single(0));
        assert!(dispatcher(2).resolve("f", "cuda,cuda:1").unwrap_err().is_config());
        assert!(dispatcher(0).resolve("f", "cuda").unwrap_err().is_resource());
    }

    #[test]
    fn test_resolve_indices() {
        let d = dispatcher(4);
        assert_eq!(d.resolve("f", "cuda:3").unwrap(), DeviceAssignment::Single(3));
        assert_eq!(
            d.resolve("f", "cuda:2, cuda:0").unwrap(),
            DeviceAssignment::Multi(vec![2, 0])
        );
        assert!(d.resolve("f", "cuda:1,cuda:1").unwrap_err().is_config());
    }

    #[test]
    fn test_out_of_range_identifies_index() {
        let err = dispatcher(1).resolve("train_device", "cuda:2").unwrap_err();
        match err {
            VigilError::Resource(ResourceError::DeviceOutOfRange { index, available, .. }) => {
                assert_eq!(index, 2);
                assert_eq!(available, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_resolve_all() {
        assert_eq!(dispatcher(4).resolve("f", "cuda:all").unwrap(), DeviceAssignment::All);
        assert_eq!(dispatcher(1).resolve("f", "cuda:all").unwrap(), DeviceAssignment::Single(0));
        assert!(dispatcher(4).resolve("f", "cuda:all,cuda:1").unwrap_err().is_config());
        assert!(dispatcher(0).resolve("f", "cuda:all").unwrap_err().is_resource());
    }

    #[test]
    fn test_unknown_tokens() {
        let d = dispatcher(2);
        for spec in ["gpu", "cuda:x", "cuda:-1", "", "cuda:0,", "tpu:0"] {
            let err = d.resolve("valid_device", spec).unwrap_err();
            assert!(err.is_config(), "{spec:?} should be a config error, got {err}");
        }
    }

    #[test]
    fn test_default_spec_follows_probe() {
        assert_eq!(dispatcher(0).resolve_or_default("f", None).unwrap(), DeviceAssignment::Cpu);
        assert_eq!(
            dispatcher(2).resolve_or_default("f", Some("  ")).unwrap(),
            DeviceAssignment::Single(0)
        );
    }

    #[test]
    fn test_placements() {
        let d = dispatcher(3);
        assert_eq!(d.placement(&DeviceAssignment::Cpu), Placement::Single(Device::Cpu));
        assert_eq!(
            d.placement(&DeviceAssignment::All),
            Placement::Replicated(vec![0, 1, 2])
        );
        let multi = d.placement(&DeviceAssignment::Multi(vec![2, 1]));
        assert_eq!(multi.primary(), Device::Accelerator(2));
        assert_eq!(multi.devices().len(), 2);

        let tensor = d.upload_tensor(vec![1.0, 2.0], &DeviceAssignment::Single(1));
        assert_eq!(tensor.device, Device::Accelerator(1));
    }

    #[test]
    fn test_upload_places_target() {
        struct Recorder(Option<Placement>);
        impl Placeable for Recorder {
            fn place(&mut self, placement: &Placement) -> Result<()> {
                self.0 = Some(placement.clone());
                Ok(())
            }
        }

        let mut target = Recorder(None);
        let placement = dispatcher(2)
            .upload(&mut target, &DeviceAssignment::Multi(vec![0, 1]))
            .unwrap();
        assert_eq!(target.0, Some(placement));
    }

    #[test]
    fn test_assignment_display() {
        assert_eq!(DeviceAssignment::Multi(vec![0, 2]).to_string(), "cuda:0,cuda:2");
        assert_eq!(DeviceAssignment::All.to_string(), "cuda:all");
    }

    #[test]
    fn test_phase_devices() {
        let config = TrainerConfig {
            train_device: Some("cuda:0,cuda:1".into()),
            test_device: Some("cpu".into()),
            ..TrainerConfig::default()
        };
        let devices = PhaseDevices::resolve(&dispatcher(2), &config).unwrap();
        assert_eq!(devices.train, DeviceAssignment::Multi(vec![0, 1]));
        assert_eq!(devices.get(Phase::Valid), &DeviceAssignment::Single(0));
        assert!(devices.test.is_cpu());

        let config = TrainerConfig {
            valid_device: Some("cuda:5".into()),
            ..TrainerConfig::default()
        };
        let err = PhaseDevices::resolve(&dispatcher(2), &config).unwrap_err();
        assert!(err.to_string().contains("valid_device"));
    }

    #[test]
    fn test_count_visible() {
        assert_eq!(count_visible("0,1,2"), 3);
        assert_eq!(count_visible(""), 0);
        assert_eq!(count_visible("-1"), 0);
    }
}
