// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Binary statistics exported by the kernel for a VM or a vCPU.
//!
//! The schema (header and descriptors) is read once when the file is opened; values are read
//! on every query.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

use kvm_sys::*;
use serde::Serialize;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

use crate::Error;
use crate::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatType {
    Cumulative,
    Instant,
    Peak,
    LinearHist,
    LogHist,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatUnit {
    None,
    Bytes,
    Seconds,
    Cycles,
    Boolean,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatBase {
    Pow10,
    Pow2,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StatDescriptor {
    pub name: String,
    pub stat_type: StatType,
    pub unit: StatUnit,
    pub base: StatBase,
    pub exponent: i16,
    /// Number of u64 values.
    pub size: u16,
    /// Byte offset of the values from the start of the data block.
    #[serde(skip)]
    pub offset: u32,
    pub bucket_size: u32,
}

fn decode_flags(flags: u32) -> Result<(StatType, StatUnit, StatBase)> {
    let stat_type = match flags & KVM_STATS_TYPE_MASK {
        KVM_STATS_TYPE_CUMULATIVE => StatType::Cumulative,
        KVM_STATS_TYPE_INSTANT => StatType::Instant,
        KVM_STATS_TYPE_PEAK => StatType::Peak,
        KVM_STATS_TYPE_LINEAR_HIST => StatType::LinearHist,
        KVM_STATS_TYPE_LOG_HIST => StatType::LogHist,
        _ => return Err(invalid_schema("unknown statistic type")),
    };
    let unit = match flags & KVM_STATS_UNIT_MASK {
        KVM_STATS_UNIT_NONE => StatUnit::None,
        KVM_STATS_UNIT_BYTES => StatUnit::Bytes,
        KVM_STATS_UNIT_SECONDS => StatUnit::Seconds,
        KVM_STATS_UNIT_CYCLES => StatUnit::Cycles,
        KVM_STATS_UNIT_BOOLEAN => StatUnit::Boolean,
        _ => return Err(invalid_schema("unknown statistic unit")),
    };
    let base = match flags & KVM_STATS_BASE_MASK {
        KVM_STATS_BASE_POW10 => StatBase::Pow10,
        KVM_STATS_BASE_POW2 => StatBase::Pow2,
        _ => return Err(invalid_schema("unknown statistic base")),
    };
    Ok((stat_type, unit, base))
}

fn invalid_schema(msg: &str) -> Error {
    Error::ReadStats(io::Error::new(io::ErrorKind::InvalidData, msg))
}

/// Value of one statistic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum StatValue {
    Bool(bool),
    Scalar(u64),
    /// Histogram buckets.
    List(Vec<u64>),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Stat {
    pub name: String,
    pub value: StatValue,
}

pub struct KvmStats {
    file: File,
    id: String,
    data_offset: u64,
    descriptors: Vec<StatDescriptor>,
}

impl KvmStats {
    /// Reads the schema of the statistics file `file`, as returned by `KVM_GET_STATS_FD`.
    pub fn new(file: File) -> Result<KvmStats> {
        let mut header = kvm_stats_header::default();
        file.read_exact_at(header.as_mut_bytes(), 0)
            .map_err(Error::ReadStats)?;

        let name_size = header.name_size as usize;
        let mut id = vec![0u8; name_size];
        file.read_exact_at(&mut id, u64::from(header.id_offset))
            .map_err(Error::ReadStats)?;

        let desc_size = std::mem::size_of::<kvm_stats_desc>() + name_size;
        let mut block = vec![0u8; desc_size * header.num_desc as usize];
        file.read_exact_at(&mut block, u64::from(header.desc_offset))
            .map_err(Error::ReadStats)?;

        let mut descriptors = Vec::with_capacity(header.num_desc as usize);
        for chunk in block.chunks_exact(desc_size) {
            let (desc, name) = kvm_stats_desc::read_from_prefix(chunk)
                .map_err(|_| invalid_schema("truncated descriptor"))?;
            let (stat_type, unit, base) = decode_flags(desc.flags)?;
            descriptors.push(StatDescriptor {
                name: c_string(name),
                stat_type,
                unit,
                base,
                exponent: desc.exponent,
                size: desc.size,
                offset: desc.offset,
                bucket_size: desc.bucket_size,
            });
        }

        Ok(KvmStats {
            file,
            id: c_string(&id),
            data_offset: u64::from(header.data_offset),
            descriptors,
        })
    }

    /// Identifier the kernel gives the VM or vCPU, e.g. `kvm-1234` or `kvm-1234/vcpu-0`.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn schema(&self) -> &[StatDescriptor] {
        &self.descriptors
    }

    /// Reads the current values of the statistics in `names`, or of every statistic when `names`
    /// is empty. Unknown names are skipped.
    pub fn query(&self, names: &[&str]) -> Result<Vec<Stat>> {
        self.descriptors
            .iter()
            .filter(|d| names.is_empty() || names.contains(&d.name.as_str()))
            .map(|d| {
                Ok(Stat {
                    name: d.name.clone(),
                    value: self.read_value(d)?,
                })
            })
            .collect()
    }

    fn read_value(&self, desc: &StatDescriptor) -> Result<StatValue> {
        let mut values = vec![0u64; desc.size as usize];
        self.file
            .read_exact_at(
                values.as_mut_bytes(),
                self.data_offset + u64::from(desc.offset),
            )
            .map_err(Error::ReadStats)?;
        Ok(match (desc.unit, values.as_slice()) {
            (StatUnit::Boolean, [v]) => StatValue::Bool(*v != 0),
            (_, [v]) => StatValue::Scalar(*v),
            _ => StatValue::List(values),
        })
    }
}

fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const NAME_SIZE: usize = 48;

    fn descriptor(flags: u32, size: u16, offset: u32, name: &str) -> Vec<u8> {
        let desc = kvm_stats_desc {
            flags,
            exponent: 0,
            size,
            offset,
            bucket_size: 0,
        };
        let mut bytes = desc.as_bytes().to_vec();
        let mut name = name.as_bytes().to_vec();
        name.resize(NAME_SIZE, 0);
        bytes.extend(name);
        bytes
    }

    fn stats_file() -> File {
        let descs = [
            descriptor(KVM_STATS_TYPE_CUMULATIVE, 1, 0, "halt_exits"),
            descriptor(
                KVM_STATS_TYPE_INSTANT | KVM_STATS_UNIT_BOOLEAN,
                1,
                8,
                "guest_mode",
            ),
            descriptor(
                KVM_STATS_TYPE_LOG_HIST | KVM_STATS_UNIT_SECONDS,
                3,
                16,
                "halt_wait_hist",
            ),
        ];
        let desc_bytes: Vec<u8> = descs.concat();
        let header_size = std::mem::size_of::<kvm_stats_header>();
        let header = kvm_stats_header {
            flags: 0,
            name_size: NAME_SIZE as u32,
            num_desc: descs.len() as u32,
            id_offset: header_size as u32,
            desc_offset: (header_size + NAME_SIZE) as u32,
            data_offset: (header_size + NAME_SIZE + desc_bytes.len()) as u32,
        };
        let mut id = b"kvm-42/vcpu-0".to_vec();
        id.resize(NAME_SIZE, 0);
        let data: [u64; 5] = [17, 1, 4, 5, 6];

        let mut file = tempfile::tempfile().unwrap();
        file.write_all(header.as_bytes()).unwrap();
        file.write_all(&id).unwrap();
        file.write_all(&desc_bytes).unwrap();
        file.write_all(data.as_bytes()).unwrap();
        file
    }

    #[test]
    fn parse_schema() {
        let stats = KvmStats::new(stats_file()).unwrap();
        assert_eq!(stats.id(), "kvm-42/vcpu-0");
        let schema = stats.schema();
        assert_eq!(schema.len(), 3);
        assert_eq!(schema[0].name, "halt_exits");
        assert_eq!(schema[0].stat_type, StatType::Cumulative);
        assert_eq!(schema[1].unit, StatUnit::Boolean);
        assert_eq!(schema[2].stat_type, StatType::LogHist);
        assert_eq!(schema[2].base, StatBase::Pow10);
    }

    #[test]
    fn query_values() {
        let stats = KvmStats::new(stats_file()).unwrap();
        let all = stats.query(&[]).unwrap();
        assert_eq!(
            all,
            vec![
                Stat {
                    name: "halt_exits".to_string(),
                    value: StatValue::Scalar(17),
                },
                Stat {
                    name: "guest_mode".to_string(),
                    value: StatValue::Bool(true),
                },
                Stat {
                    name: "halt_wait_hist".to_string(),
                    value: StatValue::List(vec![4, 5, 6]),
                },
            ]
        );
        let some = stats.query(&["guest_mode", "missing"]).unwrap();
        assert_eq!(some.len(), 1);
    }

    #[test]
    fn truncated_file_is_an_error() {
        let file = tempfile::tempfile().unwrap();
        assert!(matches!(KvmStats::new(file), Err(Error::ReadStats(_))));
    }
}
