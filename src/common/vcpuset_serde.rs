use crate::common::{DomainId, Time, VcpuId};

pub mod prelude {
    pub use super::{
        VcpuSpec,
        VcpuSetFileType,
        VcpuSetParseError,
        parse_vcpu_set,
    };
}

/// One VCPU reservation request as read from an input file.
#[derive(Clone)]
#[derive(Debug)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct VcpuSpec {
    pub domain: DomainId,
    pub vcpu: VcpuId,
    pub period: Time,
    pub slice: Time,
    #[serde(default)]
    pub sporadic: bool,
}

#[derive(Debug)]
#[derive(Clone, Copy)]
#[derive(PartialEq, Eq)]
#[derive(clap::ValueEnum)]
pub enum VcpuSetFileType {
    Auto,
    JSON,
    Plain,
}

#[derive(Debug)]
pub enum VcpuSetParseError {
    IOError(std::io::Error),
    JSONError(serde_json::Error),
    PlainParseError(String),
}

pub fn parse_vcpu_set(path: &str, typ: VcpuSetFileType) -> Result<Vec<VcpuSpec>, VcpuSetParseError> {
    use VcpuSetFileType::*;

    let path = std::path::Path::new(path);
    let extension =
        if typ == VcpuSetFileType::Auto {
            match path.extension().and_then(|e| e.to_str()) {
                Some("json") => VcpuSetFileType::JSON,
                _ => VcpuSetFileType::Plain,
            }
        } else { typ };

    let data = std::fs::read_to_string(path)?;

    let vcpus = match extension {
        Auto => unreachable!("Auto resolved above"),
        JSON => serde_json::from_str(&data)?,
        Plain => plain_deserialize_set(&data)?,
    };

    Ok(vcpus)
}

/// Plain form: one VCPU per line, `domain vcpu period_ms slice_ms [sporadic]`.
fn plain_deserialize_set(data: &str) -> Result<Vec<VcpuSpec>, VcpuSetParseError> {
    data.trim_ascii()
        .lines()
        .filter(|line| !line.trim_ascii().is_empty())
        .map(plain_deserialize_vcpu)
        .collect()
}

fn plain_deserialize_vcpu(data: &str) -> Result<VcpuSpec, VcpuSetParseError> {
    let fields: Vec<&str> = data
        .trim_ascii()
        .split_ascii_whitespace()
        .collect();

    if fields.len() != 4 && fields.len() != 5 {
        return Err(VcpuSetParseError::PlainParseError(format!(
            "VCPU parsing requires four numeric fields (domain, vcpu, period and slice) and an optional 'sporadic' marker"
        )));
    }

    let numeric = |name: &str, field: &str| -> Result<i64, VcpuSetParseError> {
        field.parse().map_err(|err| VcpuSetParseError::PlainParseError(
            format!("Failed to parse field '{name}': {err}")
        ))
    };

    Ok(VcpuSpec {
        domain: DomainId(numeric("domain", fields[0])? as u32),
        vcpu: VcpuId(numeric("vcpu", fields[1])? as u32),
        period: Time::millis(numeric("period", fields[2])?),
        slice: Time::millis(numeric("slice", fields[3])?),
        sporadic: match fields.get(4) {
            None => false,
            Some(&"sporadic") => true,
            Some(other) => {
                return Err(VcpuSetParseError::PlainParseError(format!(
                    "Unknown marker '{other}', expected 'sporadic'"
                )));
            },
        },
    })
}

// =============================================================================

impl std::fmt::Display for VcpuSetParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "VCPU Set Parse Error, ")?;
        match self {
            VcpuSetParseError::IOError(error) => write!(f, "IO: {error}")?,
            VcpuSetParseError::JSONError(error) => write!(f, "JSON: {error}")?,
            VcpuSetParseError::PlainParseError(error) => write!(f, "Plain: {error}")?,
        };

        Ok(())
    }
}

impl std::error::Error for VcpuSetParseError {}

impl From<std::io::Error> for VcpuSetParseError {
    fn from(value: std::io::Error) -> Self {
        Self::IOError(value)
    }
}

impl From<serde_json::Error> for VcpuSetParseError {
    fn from(value: serde_json::Error) -> Self {
        Self::JSONError(value)
    }
}

// =============================================================================

#[test]
fn plain_lines_parse() {
    let set = plain_deserialize_set("
        1 0 100 20
        2 0 50 10 sporadic
    ").unwrap();

    assert_eq!(set.len(), 2);
    assert_eq!(set[0].domain, DomainId(1));
    assert_eq!(set[0].period, Time::millis(100));
    assert_eq!(set[0].slice, Time::millis(20));
    assert!(!set[0].sporadic);
    assert!(set[1].sporadic);
}

#[test]
fn plain_rejects_bad_marker() {
    assert!(plain_deserialize_set("1 0 100 20 periodic").is_err());
}

#[test]
fn json_form_parses() {
    let set: Vec<VcpuSpec> = serde_json::from_str(r#"[
        { "domain": 1, "vcpu": 0, "period": "100 ms", "slice": "20 ms" },
        { "domain": 2, "vcpu": 0, "period": "50 ms", "slice": "10 ms", "sporadic": true }
    ]"#).unwrap();

    assert_eq!(set[0].period, Time::millis(100));
    assert!(set[1].sporadic);
}
