//! # Stata Reader
//!
//! Decodes Stata `.dta` files into a polars `DataFrame` so they enter the same
//! casting and listwise-deletion path as the delimited and columnar formats.
//!
//! - Releases 114 and 115 (Stata 10 to 12) use the fixed binary header.
//! - Releases 117, 118 and 119 (Stata 13 and later) use the tagged layout
//!   with a section map; long strings (`strL`) are resolved from the `<strls>`
//!   section.
//! - Stata's missing values (`.`, `.a` to `.z`) become nulls.
//!
//! Value labels, characteristics and the sort order are not read.

use polars::prelude::*;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

/// Largest non-missing values per storage type. Anything above encodes `.`
/// or one of the extended missing values.
const BYTE_MAX: i8 = 100;
const INT_MAX: i16 = 32_740;
const LONG_MAX: i32 = 2_147_483_620;
const FLOAT_MAX_BITS: u32 = 0x7eff_ffff;
const DOUBLE_MAX_BITS: u64 = 0x7fdf_ffff_ffff_ffff;

/// Index of the `<data>` and `<strls>` offsets in the tagged section map.
const MAP_DATA: usize = 9;
const MAP_STRLS: usize = 10;
const MAP_ENTRIES: usize = 14;

#[derive(Error, Debug)]
pub enum DtaError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unsupported Stata release '{0}'. Releases 114, 115, 117, 118 and 119 can be read.")]
    UnsupportedRelease(String),
    #[error("Unknown byte order marker '{0}'.")]
    ByteOrder(String),
    #[error("The file ends unexpectedly at byte {0}.")]
    Truncated(usize),
    #[error("Expected '{expected}' at byte {offset}.")]
    MissingTag { expected: String, offset: usize },
    #[error("Variable '{variable}' has the unknown storage type code {code}.")]
    UnknownType { variable: String, code: u16 },
    #[error(transparent)]
    Frame(#[from] PolarsError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endian {
    Big,
    Little,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NumericType {
    Byte,
    Int,
    Long,
    Float,
    Double,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StorageType {
    Str(usize),
    StrL,
    Numeric(NumericType),
}

impl StorageType {
    fn from_tagged(code: u16) -> Option<Self> {
        match code {
            1..=2045 => Some(StorageType::Str(code as usize)),
            32768 => Some(StorageType::StrL),
            65526 => Some(StorageType::Numeric(NumericType::Double)),
            65527 => Some(StorageType::Numeric(NumericType::Float)),
            65528 => Some(StorageType::Numeric(NumericType::Long)),
            65529 => Some(StorageType::Numeric(NumericType::Int)),
            65530 => Some(StorageType::Numeric(NumericType::Byte)),
            _ => None,
        }
    }

    fn from_legacy(code: u8) -> Option<Self> {
        match code {
            1..=244 => Some(StorageType::Str(code as usize)),
            251 => Some(StorageType::Numeric(NumericType::Byte)),
            252 => Some(StorageType::Numeric(NumericType::Int)),
            253 => Some(StorageType::Numeric(NumericType::Long)),
            254 => Some(StorageType::Numeric(NumericType::Float)),
            255 => Some(StorageType::Numeric(NumericType::Double)),
            _ => None,
        }
    }
}

/// Where a strL cell's `(v, o)` key splits its eight bytes.
#[derive(Debug, Clone, Copy)]
struct StrlKeyLayout {
    v_bytes: usize,
    o_bytes: usize,
}

impl StrlKeyLayout {
    fn for_release(release: u16) -> Self {
        match release {
            ..=117 => StrlKeyLayout { v_bytes: 4, o_bytes: 4 },
            118 => StrlKeyLayout { v_bytes: 2, o_bytes: 6 },
            _ => StrlKeyLayout { v_bytes: 3, o_bytes: 5 },
        }
    }
}

struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
    endian: Endian,
}

macro_rules! read_number {
    ($name:ident, $ty:ty) => {
        fn $name(&mut self) -> Result<$ty, DtaError> {
            let bytes = self.array()?;
            Ok(match self.endian {
                Endian::Big => <$ty>::from_be_bytes(bytes),
                Endian::Little => <$ty>::from_le_bytes(bytes),
            })
        }
    };
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            pos: 0,
            endian: Endian::Little,
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DtaError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or(DtaError::Truncated(self.pos))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DtaError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DtaError> {
        Ok(self.take(1)?[0])
    }

    read_number!(u16, u16);
    read_number!(u32, u32);
    read_number!(u64, u64);
    read_number!(i16, i16);
    read_number!(i32, i32);
    read_number!(f32, f32);
    read_number!(f64, f64);

    /// Unsigned integer of `width` bytes in the file's byte order.
    fn uint(&mut self, width: usize) -> Result<u64, DtaError> {
        let bytes = self.take(width)?;
        let fold = |acc: u64, &b: &u8| (acc << 8) | u64::from(b);
        Ok(match self.endian {
            Endian::Big => bytes.iter().fold(0, fold),
            Endian::Little => bytes.iter().rev().fold(0, fold),
        })
    }

    fn text(&mut self, width: usize) -> Result<String, DtaError> {
        Ok(fixed_text(self.take(width)?))
    }

    fn skip(&mut self, n: usize) -> Result<(), DtaError> {
        self.take(n).map(|_| ())
    }

    fn at_tag(&self, tag: &str) -> bool {
        self.bytes.get(self.pos..self.pos + tag.len()) == Some(tag.as_bytes())
    }

    fn tag(&mut self, tag: &str) -> Result<(), DtaError> {
        if !self.at_tag(tag) {
            return Err(DtaError::MissingTag {
                expected: tag.to_string(),
                offset: self.pos,
            });
        }
        self.pos += tag.len();
        Ok(())
    }

    fn seek(&mut self, offset: u64) -> Result<(), DtaError> {
        let offset = usize::try_from(offset)
            .ok()
            .filter(|&o| o <= self.bytes.len())
            .ok_or(DtaError::Truncated(self.bytes.len()))?;
        self.pos = offset;
        Ok(())
    }
}

/// Bytes up to the first NUL, decoded leniently.
fn fixed_text(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Decoded cells of one variable, tagged with how each cell is stored.
enum ColumnValues {
    Numeric(NumericType, Vec<Option<f64>>),
    Text(usize, Vec<Option<String>>),
    StrL(StrlKeyLayout, Vec<(u64, u64)>),
}

impl ColumnValues {
    fn new(storage: StorageType, strl: StrlKeyLayout, capacity: usize) -> Self {
        match storage {
            StorageType::Str(width) => ColumnValues::Text(width, Vec::with_capacity(capacity)),
            StorageType::StrL => ColumnValues::StrL(strl, Vec::with_capacity(capacity)),
            StorageType::Numeric(kind) => ColumnValues::Numeric(kind, Vec::with_capacity(capacity)),
        }
    }

    fn read_cell(&mut self, reader: &mut ByteReader<'_>) -> Result<(), DtaError> {
        match self {
            ColumnValues::Text(width, column) => column.push(Some(reader.text(*width)?)),
            ColumnValues::StrL(layout, keys) => {
                let v = reader.uint(layout.v_bytes)?;
                let o = reader.uint(layout.o_bytes)?;
                keys.push((v, o));
            }
            ColumnValues::Numeric(kind, column) => {
                let value = match kind {
                    NumericType::Byte => {
                        let v = reader.u8()? as i8;
                        (v <= BYTE_MAX).then_some(f64::from(v))
                    }
                    NumericType::Int => {
                        let v = reader.i16()?;
                        (v <= INT_MAX).then_some(f64::from(v))
                    }
                    NumericType::Long => {
                        let v = reader.i32()?;
                        (v <= LONG_MAX).then_some(f64::from(v))
                    }
                    NumericType::Float => {
                        let v = reader.f32()?;
                        (v <= f32::from_bits(FLOAT_MAX_BITS)).then_some(f64::from(v))
                    }
                    NumericType::Double => {
                        let v = reader.f64()?;
                        (v <= f64::from_bits(DOUBLE_MAX_BITS)).then_some(v)
                    }
                };
                column.push(value);
            }
        }
        Ok(())
    }
}

struct Variable {
    name: String,
    storage: StorageType,
}

fn read_rows(
    reader: &mut ByteReader<'_>,
    variables: &[Variable],
    n_obs: usize,
    strl: StrlKeyLayout,
) -> Result<Vec<ColumnValues>, DtaError> {
    // A corrupt header must not trigger a huge allocation.
    let capacity = n_obs.min(reader.bytes.len() - reader.pos);
    let mut columns: Vec<ColumnValues> = variables
        .iter()
        .map(|v| ColumnValues::new(v.storage, strl, capacity))
        .collect();
    for _ in 0..n_obs {
        for column in columns.iter_mut() {
            column.read_cell(reader)?;
        }
    }
    Ok(columns)
}

/// Reads the `<strls>` section into a map from `(v, o)` to string.
fn read_strls(reader: &mut ByteReader<'_>, release: u16) -> Result<HashMap<(u64, u64), String>, DtaError> {
    let mut strls = HashMap::new();
    reader.tag("<strls>")?;
    while reader.at_tag("GSO") {
        reader.tag("GSO")?;
        let v = u64::from(reader.u32()?);
        let o = if release == 117 {
            u64::from(reader.u32()?)
        } else {
            reader.u64()?
        };
        let kind = reader.u8()?;
        let len = reader.u32()? as usize;
        let bytes = reader.take(len)?;
        // 130 marks a NUL-terminated ASCII string, 129 a binary blob.
        let text = if kind == 130 {
            fixed_text(bytes)
        } else {
            String::from_utf8_lossy(bytes).into_owned()
        };
        strls.insert((v, o), text);
    }
    reader.tag("</strls>")?;
    Ok(strls)
}

fn into_frame(
    variables: Vec<Variable>,
    columns: Vec<ColumnValues>,
    strls: &HashMap<(u64, u64), String>,
) -> Result<DataFrame, DtaError> {
    let columns: Vec<Column> = variables
        .into_iter()
        .zip(columns)
        .map(|(variable, values)| {
            let name: PlSmallStr = variable.name.into();
            match values {
                ColumnValues::Numeric(_, v) => Column::new(name, v),
                ColumnValues::Text(_, v) => Column::new(name, v),
                ColumnValues::StrL(_, keys) => {
                    let resolved: Vec<Option<String>> = keys
                        .into_iter()
                        .map(|key| match key {
                            (0, 0) => Some(String::new()),
                            key => strls.get(&key).cloned(),
                        })
                        .collect();
                    Column::new(name, resolved)
                }
            }
        })
        .collect();
    Ok(DataFrame::new(columns)?)
}

fn parse_tagged(bytes: &[u8]) -> Result<DataFrame, DtaError> {
    let mut reader = ByteReader::new(bytes);
    reader.tag("<stata_dta>")?;
    reader.tag("<header>")?;
    reader.tag("<release>")?;
    let release_text = reader.text(3)?;
    let release: u16 = match release_text.as_str() {
        "117" => 117,
        "118" => 118,
        "119" => 119,
        _ => return Err(DtaError::UnsupportedRelease(release_text)),
    };
    reader.tag("</release>")?;

    reader.tag("<byteorder>")?;
    let order = reader.text(3)?;
    reader.endian = match order.as_str() {
        "MSF" => Endian::Big,
        "LSF" => Endian::Little,
        _ => return Err(DtaError::ByteOrder(order)),
    };
    reader.tag("</byteorder>")?;

    reader.tag("<K>")?;
    let n_vars = if release == 119 {
        reader.u32()? as usize
    } else {
        usize::from(reader.u16()?)
    };
    reader.tag("</K>")?;
    reader.tag("<N>")?;
    let n_obs = if release == 117 {
        u64::from(reader.u32()?)
    } else {
        reader.u64()?
    };
    let n_obs = usize::try_from(n_obs).map_err(|_| DtaError::Truncated(reader.pos))?;
    reader.tag("</N>")?;

    reader.tag("<label>")?;
    let label_len = if release == 117 {
        usize::from(reader.u8()?)
    } else {
        usize::from(reader.u16()?)
    };
    reader.skip(label_len)?;
    reader.tag("</label>")?;
    reader.tag("<timestamp>")?;
    let stamp_len = usize::from(reader.u8()?);
    reader.skip(stamp_len)?;
    reader.tag("</timestamp>")?;
    reader.tag("</header>")?;

    reader.tag("<map>")?;
    let mut map = [0u64; MAP_ENTRIES];
    for entry in map.iter_mut() {
        *entry = reader.u64()?;
    }
    reader.tag("</map>")?;

    reader.tag("<variable_types>")?;
    let codes: Vec<u16> = (0..n_vars).map(|_| reader.u16()).collect::<Result<_, _>>()?;
    reader.tag("</variable_types>")?;
    let name_width = if release == 117 { 33 } else { 129 };
    reader.tag("<varnames>")?;
    let names: Vec<String> = (0..n_vars)
        .map(|_| reader.text(name_width))
        .collect::<Result<_, _>>()?;
    reader.tag("</varnames>")?;

    let variables: Vec<Variable> = names
        .into_iter()
        .zip(codes)
        .map(|(name, code)| match StorageType::from_tagged(code) {
            Some(storage) => Ok(Variable { name, storage }),
            None => Err(DtaError::UnknownType { variable: name, code }),
        })
        .collect::<Result<_, _>>()?;
    log::debug!("Stata release {release}: {n_vars} variables, {n_obs} observations.");

    reader.seek(map[MAP_DATA])?;
    reader.tag("<data>")?;
    let columns = read_rows(&mut reader, &variables, n_obs, StrlKeyLayout::for_release(release))?;
    reader.tag("</data>")?;

    let strls = if variables.iter().any(|v| v.storage == StorageType::StrL) {
        reader.seek(map[MAP_STRLS])?;
        read_strls(&mut reader, release)?
    } else {
        HashMap::new()
    };
    into_frame(variables, columns, &strls)
}

fn parse_legacy(bytes: &[u8]) -> Result<DataFrame, DtaError> {
    let mut reader = ByteReader::new(bytes);
    let release = reader.u8()?;
    if !matches!(release, 114 | 115) {
        return Err(DtaError::UnsupportedRelease(release.to_string()));
    }
    let order = reader.u8()?;
    reader.endian = match order {
        1 => Endian::Big,
        2 => Endian::Little,
        other => return Err(DtaError::ByteOrder(other.to_string())),
    };
    // filetype and an unused byte
    reader.skip(2)?;
    let n_vars = usize::from(reader.u16()?);
    let n_obs = reader.u32()? as usize;
    // data label and timestamp
    reader.skip(81 + 18)?;

    let codes: Vec<u8> = (0..n_vars).map(|_| reader.u8()).collect::<Result<_, _>>()?;
    let names: Vec<String> = (0..n_vars).map(|_| reader.text(33)).collect::<Result<_, _>>()?;
    // sort list, formats, value label names, variable labels
    reader.skip(2 * (n_vars + 1) + 49 * n_vars + 33 * n_vars + 81 * n_vars)?;
    loop {
        let kind = reader.u8()?;
        let len = reader.u32()? as usize;
        if kind == 0 && len == 0 {
            break;
        }
        reader.skip(len)?;
    }

    let variables: Vec<Variable> = names
        .into_iter()
        .zip(codes)
        .map(|(name, code)| match StorageType::from_legacy(code) {
            Some(storage) => Ok(Variable { name, storage }),
            None => Err(DtaError::UnknownType {
                variable: name,
                code: u16::from(code),
            }),
        })
        .collect::<Result<_, _>>()?;
    log::debug!("Stata release {release}: {n_vars} variables, {n_obs} observations.");

    let layout = StrlKeyLayout::for_release(u16::from(release));
    let columns = read_rows(&mut reader, &variables, n_obs, layout)?;
    into_frame(variables, columns, &HashMap::new())
}

/// Decodes an in-memory `.dta` file.
pub fn parse_dta(bytes: &[u8]) -> Result<DataFrame, DtaError> {
    if bytes.starts_with(b"<stata_dta>") {
        parse_tagged(bytes)
    } else {
        parse_legacy(bytes)
    }
}

pub fn read_dta(path: &Path) -> Result<DataFrame, DtaError> {
    let bytes = std::fs::read(path)?;
    parse_dta(&bytes)
}
