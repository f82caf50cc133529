//! Run parameters of the fabric.
//!
//! Command-line handling lives in the binaries; this is the validated
//! parameter set every component receives explicitly (no process-wide
//! parameter singleton).

use crate::error::ConfigError;

/// Which side of the fabric a hosted instance belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// Reads a data source, sends timeslice components.
    Input,
    /// Assembles timeslices, feeds workers.
    Compute,
}

/// The validated parameter set of a run.
#[derive(Debug, Clone)]
pub struct Parameters {
    /// Names of the input nodes, index order.
    pub input_nodes: Vec<String>,
    /// Names of the compute nodes, index order.
    pub compute_nodes: Vec<String>,
    /// First listening port; compute node `c` listens on `base_port + c`.
    pub base_port: u16,
    /// Core microslices per timeslice.
    pub timeslice_size: u32,
    /// Trailing overlap microslices per timeslice.
    pub overlap_size: u32,
    /// Number of timeslices to build before shutting down.
    pub max_timeslice_number: u64,
    /// Input data arena size exponent (bytes).
    pub in_data_buffer_size_exp: u32,
    /// Input descriptor arena size exponent (entries).
    pub in_desc_buffer_size_exp: u32,
    /// Compute data arena size exponent per input (bytes).
    pub cn_data_buffer_size_exp: u32,
    /// Compute descriptor arena size exponent per input (entries).
    pub cn_desc_buffer_size_exp: u32,
    /// Typical microslice content size in bytes.
    pub typical_content_size: u32,
    /// Randomize microslice content sizes around the typical size.
    pub randomize_sizes: bool,
    /// Worker subprocess command; `%s` is replaced by the shared-memory
    /// identifier. Empty disables subprocess workers.
    pub processor_executable: String,
    /// Number of worker subprocesses per compute node.
    pub processor_instances: u32,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            input_nodes: vec!["localhost".to_owned()],
            compute_nodes: vec!["localhost".to_owned()],
            base_port: 20079,
            timeslice_size: 100,
            overlap_size: 2,
            max_timeslice_number: 1024,
            in_data_buffer_size_exp: 26,
            in_desc_buffer_size_exp: 16,
            cn_data_buffer_size_exp: 24,
            cn_desc_buffer_size_exp: 12,
            typical_content_size: 1024,
            randomize_sizes: false,
            processor_executable: String::new(),
            processor_instances: 1,
        }
    }
}

impl Parameters {
    /// Number of input nodes.
    pub fn num_inputs(&self) -> usize {
        self.input_nodes.len()
    }

    /// Number of compute nodes.
    pub fn num_computes(&self) -> usize {
        self.compute_nodes.len()
    }

    /// Microslices per timeslice including the overlap.
    pub fn timeslice_length(&self) -> u64 {
        u64::from(self.timeslice_size) + u64::from(self.overlap_size)
    }

    /// Validates the parameter set.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.input_nodes.is_empty() {
            return Err(ConfigError::EmptyNodeList("input"));
        }
        if self.compute_nodes.is_empty() {
            return Err(ConfigError::EmptyNodeList("compute"));
        }
        if self.timeslice_size == 0 {
            return Err(ConfigError::InvalidSize {
                name: "timeslice_size",
                value: 0,
            });
        }
        if self.max_timeslice_number == 0 {
            return Err(ConfigError::InvalidSize {
                name: "max_timeslice_number",
                value: 0,
            });
        }
        if self.typical_content_size == 0 {
            return Err(ConfigError::InvalidSize {
                name: "typical_content_size",
                value: 0,
            });
        }
        for (name, exp) in [
            ("in_data_buffer_size_exp", self.in_data_buffer_size_exp),
            ("in_desc_buffer_size_exp", self.in_desc_buffer_size_exp),
            ("cn_data_buffer_size_exp", self.cn_data_buffer_size_exp),
            ("cn_desc_buffer_size_exp", self.cn_desc_buffer_size_exp),
        ] {
            if exp == 0 || exp >= 48 {
                return Err(ConfigError::InvalidSize {
                    name,
                    value: u64::from(exp),
                });
            }
        }
        // the sender needs one full timeslice plus the next descriptor
        // resident in the input descriptor ring
        let needed = self.timeslice_length() + 1;
        if needed > (1u64 << self.in_desc_buffer_size_exp) {
            return Err(ConfigError::TimesliceDoesNotFit {
                desc_exp: self.in_desc_buffer_size_exp,
                needed,
            });
        }
        Ok(())
    }
}
