//! Per-frame function values and the `.npy` files batch jobs write them to.

use std::path::Path;

use crate::error::{Result, WrapperError};

const NPY_MAGIC: &[u8] = b"\x93NUMPY";

/// Row-major `(n_frames, n_dim)` matrix of function values.
#[derive(Debug, Clone, PartialEq)]
pub struct Values {
    n_frames: usize,
    n_dim: usize,
    data: Vec<f64>,
}

impl Values {
    pub fn new(n_frames: usize, n_dim: usize, data: Vec<f64>) -> Result<Self> {
        if n_frames.checked_mul(n_dim) != Some(data.len()) {
            return Err(WrapperError::Computation(format!(
                "value shape ({n_frames}, {n_dim}) does not match {} elements",
                data.len()
            )));
        }
        Ok(Self {
            n_frames,
            n_dim,
            data,
        })
    }

    /// One value per frame, shape `(n, 1)`.
    pub fn from_column(col: Vec<f64>) -> Self {
        Self {
            n_frames: col.len(),
            n_dim: 1,
            data: col,
        }
    }

    pub fn from_rows(rows: Vec<Vec<f64>>) -> Result<Self> {
        let n_dim = rows.first().map(|r| r.len()).unwrap_or(0);
        if let Some(bad) = rows.iter().position(|r| r.len() != n_dim) {
            return Err(WrapperError::Computation(format!(
                "ragged rows: row {bad} has {} values, expected {n_dim}",
                rows[bad].len()
            )));
        }
        let n_frames = rows.len();
        Ok(Self {
            n_frames,
            n_dim,
            data: rows.into_iter().flatten().collect(),
        })
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.n_frames, self.n_dim)
    }

    pub fn n_frames(&self) -> usize {
        self.n_frames
    }

    pub fn n_dim(&self) -> usize {
        self.n_dim
    }

    pub fn get(&self, frame: usize, dim: usize) -> Option<f64> {
        if frame < self.n_frames && dim < self.n_dim {
            Some(self.data[frame * self.n_dim + dim])
        } else {
            None
        }
    }

    pub fn row(&self, frame: usize) -> Option<&[f64]> {
        if frame < self.n_frames {
            Some(&self.data[frame * self.n_dim..(frame + 1) * self.n_dim])
        } else {
            None
        }
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f64]> {
        // chunks(0) panics; an empty matrix has no rows anyway.
        self.data.chunks(self.n_dim.max(1)).take(self.n_frames)
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }
}

/// Read a 1-D or 2-D little-endian numeric `.npy` file.
pub fn load_npy(path: &Path) -> Result<Values> {
    let bytes = std::fs::read(path).map_err(|err| WrapperError::io(path, err))?;
    decode_npy(path, &bytes)
}

/// [`load_npy`] without blocking the runtime on the read.
pub async fn read_npy(path: &Path) -> Result<Values> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|err| WrapperError::io(path, err))?;
    decode_npy(path, &bytes)
}

fn decode_npy(path: &Path, bytes: &[u8]) -> Result<Values> {
    parse_npy(bytes).map_err(|msg| {
        WrapperError::Computation(format!("failed to read '{}': {msg}", path.display()))
    })
}

/// Write `values` as a version 1.0 `<f8` `.npy` file.
pub fn save_npy(path: &Path, values: &Values) -> Result<()> {
    std::fs::write(path, encode_npy(values)).map_err(|err| WrapperError::io(path, err))
}

fn encode_npy(values: &Values) -> Vec<u8> {
    let mut header = format!(
        "{{'descr': '<f8', 'fortran_order': False, 'shape': ({}, {}), }}",
        values.n_frames, values.n_dim
    );
    // magic(6) + version(2) + len(2) + header + '\n' must be a multiple of 64
    let unpadded = 10 + header.len() + 1;
    let pad = (64 - unpadded % 64) % 64;
    header.push_str(&" ".repeat(pad));
    header.push('\n');

    let mut out = Vec::with_capacity(10 + header.len() + values.data.len() * 8);
    out.extend_from_slice(NPY_MAGIC);
    out.extend_from_slice(&[1, 0]);
    out.extend_from_slice(&(header.len() as u16).to_le_bytes());
    out.extend_from_slice(header.as_bytes());
    for v in &values.data {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

fn parse_npy(bytes: &[u8]) -> std::result::Result<Values, String> {
    if bytes.len() < 10 || &bytes[..6] != NPY_MAGIC {
        return Err("not an npy file (bad magic)".to_string());
    }
    let major = bytes[6];
    let (header_len, header_start) = match major {
        1 => (u16::from_le_bytes([bytes[8], bytes[9]]) as usize, 10),
        2 | 3 => {
            if bytes.len() < 12 {
                return Err("truncated header".to_string());
            }
            (
                u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize,
                12,
            )
        }
        v => return Err(format!("unsupported npy version {v}")),
    };
    let data_start = header_start + header_len;
    if bytes.len() < data_start {
        return Err("truncated header".to_string());
    }
    let header = std::str::from_utf8(&bytes[header_start..data_start])
        .map_err(|_| "header is not valid text".to_string())?;

    let descr = dict_str(header, "descr").ok_or("missing 'descr'")?;
    let fortran = header_field(header, "fortran_order")
        .map(|v| v.trim_start().starts_with("True"))
        .unwrap_or(false);
    let shape = parse_shape(header)?;

    let (elem, decode): (usize, fn(&[u8]) -> f64) = match descr {
        "<f8" => (8, |b| f64::from_le_bytes(b.try_into().unwrap_or([0; 8]))),
        "<f4" => (4, |b| f32::from_le_bytes(b.try_into().unwrap_or([0; 4])) as f64),
        "<i8" => (8, |b| i64::from_le_bytes(b.try_into().unwrap_or([0; 8])) as f64),
        "<i4" => (4, |b| i32::from_le_bytes(b.try_into().unwrap_or([0; 4])) as f64),
        other => return Err(format!("unsupported dtype '{other}'")),
    };

    let (n_frames, n_dim) = match shape.as_slice() {
        [] => (1, 1),
        [n] => (*n, 1),
        [n, d] => (*n, *d),
        _ => return Err(format!("expected a 1-D or 2-D array, got shape {shape:?}")),
    };
    let (count, byte_len) = n_frames
        .checked_mul(n_dim)
        .and_then(|c| c.checked_mul(elem).map(|b| (c, b)))
        .ok_or_else(|| format!("shape {shape:?} is too large"))?;
    let payload = &bytes[data_start..];
    if payload.len() < byte_len {
        return Err(format!(
            "payload too short: {} bytes for {count} elements",
            payload.len()
        ));
    }
    let flat: Vec<f64> = payload
        .chunks_exact(elem)
        .take(count)
        .map(decode)
        .collect();

    let data = if fortran && n_dim > 1 {
        let mut out = vec![0.0; count];
        for f in 0..n_frames {
            for d in 0..n_dim {
                out[f * n_dim + d] = flat[d * n_frames + f];
            }
        }
        out
    } else {
        flat
    };
    Ok(Values {
        n_frames,
        n_dim,
        data,
    })
}

fn header_field<'a>(header: &'a str, key: &str) -> Option<&'a str> {
    let needle = format!("'{key}':");
    let idx = header.find(&needle)?;
    Some(&header[idx + needle.len()..])
}

fn dict_str<'a>(header: &'a str, key: &str) -> Option<&'a str> {
    let rest = header_field(header, key)?.trim_start();
    let rest = rest.strip_prefix('\'')?;
    let end = rest.find('\'')?;
    Some(&rest[..end])
}

fn parse_shape(header: &str) -> std::result::Result<Vec<usize>, String> {
    let rest = header_field(header, "shape").ok_or("missing 'shape'")?;
    let open = rest.find('(').ok_or("malformed 'shape'")?;
    let close = rest.find(')').ok_or("malformed 'shape'")?;
    rest[open + 1..close]
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<usize>().map_err(|_| format!("bad shape entry '{s}'")))
        .collect()
}
