//! Host and process readings from procfs text interfaces
//!
//! The sampled names form a closed, fixed list. A name on the list that is
//! missing from its source file fails the whole sample; names outside the
//! list are never produced. Parsers are pure functions over file contents so
//! they test against fixture strings without a live `/proc`.

use rand::Rng;
use tokio::fs;

const BYTES_PER_KIBIBYTE: u64 = 1024;

const PROC_MEMINFO: &str = "/proc/meminfo";
const PROC_SELF_STATUS: &str = "/proc/self/status";
const PROC_SELF_STAT: &str = "/proc/self/stat";
const PROC_UPTIME: &str = "/proc/uptime";
const PROC_LOADAVG: &str = "/proc/loadavg";

/// Name of the per-tick random diagnostic gauge.
pub const RANDOM_VALUE: &str = "random_value";
/// Name of the counter recording successful poll ticks.
pub const POLL_COUNT: &str = "poll_count";

/// Gauges produced per sample: the two keyed tables below, six stat fields,
/// uptime, three load averages and the random diagnostic value.
const GAUGES_PER_SAMPLE: usize = 29;

/// Pairs a procfs line key with the gauge it feeds.
type FieldTable = &'static [(&'static str, &'static str)];

const MEMINFO_GAUGES: FieldTable = &[
    ("MemTotal:", "mem_total_bytes"),
    ("MemFree:", "mem_free_bytes"),
    ("MemAvailable:", "mem_available_bytes"),
    ("Buffers:", "buffers_bytes"),
    ("Cached:", "cached_bytes"),
    ("SwapTotal:", "swap_total_bytes"),
    ("SwapFree:", "swap_free_bytes"),
    ("Active:", "active_bytes"),
    ("Inactive:", "inactive_bytes"),
];

const STATUS_GAUGES: FieldTable = &[
    ("VmPeak:", "vm_peak_bytes"),
    ("VmSize:", "vm_size_bytes"),
    ("VmRSS:", "vm_rss_bytes"),
    ("VmData:", "vm_data_bytes"),
    ("VmStk:", "vm_stk_bytes"),
    ("VmExe:", "vm_exe_bytes"),
    ("VmLib:", "vm_lib_bytes"),
    ("VmSwap:", "vm_swap_bytes"),
    ("Threads:", "threads"),
];

#[derive(thiserror::Error, Debug)]
/// Errors produced by functions in this module
pub enum Error {
    /// Wrapper for [`std::io::Error`]
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for [`std::num::ParseIntError`]
    #[error("Integer Parsing: {0}")]
    ParseInt(#[from] std::num::ParseIntError),
    /// Wrapper for [`std::num::ParseFloatError`]
    #[error("Float Parsing: {0}")]
    ParseFloat(#[from] std::num::ParseFloatError),
    /// A name on the fixed list is absent from its source file
    #[error("{file} missing required field {field}")]
    MissingField {
        /// The procfs file read.
        file: &'static str,
        /// The field the list demands.
        field: &'static str,
    },
    /// A value carried a unit suffix this module does not understand
    #[error("unknown unit {unit} in {file}")]
    UnknownUnit {
        /// The procfs file read.
        file: &'static str,
        /// The unit as it appeared.
        unit: String,
    },
    /// A source file's shape was not as proc(5) promises
    #[error("{file} malformed: {detail}")]
    Malformed {
        /// The procfs file read.
        file: &'static str,
        /// What was wrong with it.
        detail: &'static str,
    },
}

/// One full reading of the fixed gauge list, random diagnostic included.
#[derive(Debug, Clone)]
pub struct Sample {
    /// Gauge readings, name to value.
    pub gauges: Vec<(&'static str, f64)>,
}

/// Read every source file and produce a [`Sample`].
///
/// # Errors
///
/// Function will error if any source file cannot be read or any name on the
/// fixed list is missing from its source. The whole sample fails together,
/// the caller decides whether to skip the tick.
pub async fn sample() -> Result<Sample, Error> {
    let mut gauges = Vec::with_capacity(GAUGES_PER_SAMPLE);

    // NOTE `read_to_string` uses as few IO operations as possible in its
    // implementation, so each file very likely arrives in one read.
    let meminfo = fs::read_to_string(PROC_MEMINFO).await?;
    parse_keyed_fields(PROC_MEMINFO, MEMINFO_GAUGES, &meminfo, &mut gauges)?;

    let status = fs::read_to_string(PROC_SELF_STATUS).await?;
    parse_keyed_fields(PROC_SELF_STATUS, STATUS_GAUGES, &status, &mut gauges)?;

    let stat = fs::read_to_string(PROC_SELF_STAT).await?;
    parse_stat(&stat, &mut gauges)?;

    let uptime = fs::read_to_string(PROC_UPTIME).await?;
    parse_uptime(&uptime, &mut gauges)?;

    let loadavg = fs::read_to_string(PROC_LOADAVG).await?;
    parse_loadavg(&loadavg, &mut gauges)?;

    gauges.push((RANDOM_VALUE, rand::rng().random::<f64>()));
    Ok(Sample { gauges })
}

/// Scan `key value [unit]` lines for the keys in `table`, in kibibytes when
/// the line says so. Every key in the table must appear.
fn parse_keyed_fields(
    file: &'static str,
    table: FieldTable,
    contents: &str,
    gauges: &mut Vec<(&'static str, f64)>,
) -> Result<(), Error> {
    let mut values: Vec<Option<f64>> = vec![None; table.len()];
    for line in contents.lines() {
        let mut parts = line.split_whitespace();
        let Some(key) = parts.next() else {
            continue;
        };
        let Some(slot) = table.iter().position(|(want, _)| *want == key) else {
            continue;
        };
        let raw = parts.next().ok_or(Error::Malformed {
            file,
            detail: "field line carries no value",
        })?;
        let numeric = raw.parse::<u64>()?;
        values[slot] = Some(match parts.next() {
            Some("kB") => numeric.saturating_mul(BYTES_PER_KIBIBYTE) as f64,
            Some(unknown) => {
                return Err(Error::UnknownUnit {
                    file,
                    unit: unknown.to_string(),
                });
            }
            None => numeric as f64,
        });
    }
    for (&(key, name), value) in table.iter().zip(values) {
        let value = value.ok_or(Error::MissingField { file, field: key })?;
        gauges.push((name, value));
    }
    Ok(())
}

/// Pick fault, CPU tick and memory fields out of `/proc/self/stat`.
fn parse_stat(contents: &str, gauges: &mut Vec<(&'static str, f64)>) -> Result<(), Error> {
    // The comm field is parenthesized and may itself contain whitespace or
    // parens, so split only after the last closing paren. See proc(5).
    let end_paren = contents.rfind(')').ok_or(Error::Malformed {
        file: PROC_SELF_STAT,
        detail: "no closing paren around comm",
    })?;
    let after = contents.get(end_paren + 2..).ok_or(Error::Malformed {
        file: PROC_SELF_STAT,
        detail: "nothing follows the comm field",
    })?;
    let parts: Vec<&str> = after.split_whitespace().collect();

    // proc(5) numbers fields from one: pid is 1, comm 2, state 3. With the
    // first two consumed above, field N sits at parts[N - 3].
    let mut field = |number: usize, name: &'static str| -> Result<(), Error> {
        let raw = parts.get(number - 3).ok_or(Error::MissingField {
            file: PROC_SELF_STAT,
            field: name,
        })?;
        gauges.push((name, raw.parse::<i64>()? as f64));
        Ok(())
    };
    field(10, "minor_faults")?;
    field(12, "major_faults")?;
    field(14, "utime_ticks")?;
    field(15, "stime_ticks")?;
    field(23, "vsize_bytes")?;
    field(24, "rss_pages")?;
    Ok(())
}

fn parse_uptime(contents: &str, gauges: &mut Vec<(&'static str, f64)>) -> Result<(), Error> {
    let raw = contents.split_whitespace().next().ok_or(Error::MissingField {
        file: PROC_UPTIME,
        field: "uptime_seconds",
    })?;
    gauges.push(("uptime_seconds", raw.parse::<f64>()?));
    Ok(())
}

fn parse_loadavg(contents: &str, gauges: &mut Vec<(&'static str, f64)>) -> Result<(), Error> {
    let mut parts = contents.split_whitespace();
    for name in ["load_average_one", "load_average_five", "load_average_fifteen"] {
        let raw = parts.next().ok_or(Error::MissingField {
            file: PROC_LOADAVG,
            field: name,
        })?;
        gauges.push((name, raw.parse::<f64>()?));
    }
    Ok(())
}
