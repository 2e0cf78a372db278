use std::{
    fs::File,
    io::{self, ErrorKind, Read, Write},
    path::Path,
};

use bincode::{Decode, Encode};

/// Save to file, using Bincode.
pub fn save<T: Encode>(path: &Path, data: &T) -> io::Result<()> {
    let config = bincode::config::standard();

    let encoded: Vec<u8> = bincode::encode_to_vec(data, config)
        .map_err(|e| io::Error::new(ErrorKind::InvalidData, e.to_string()))?;

    let mut file = File::create(path)?;
    file.write_all(&encoded)?;
    Ok(())
}

/// Load from file, using Bincode.
pub fn load<T: Decode<()>>(path: &Path) -> io::Result<T> {
    let config = bincode::config::standard();

    let mut file = File::open(path)?;
    let mut buffer = Vec::new();
    file.read_to_end(&mut buffer)?;

    let (decoded, _len) = bincode::decode_from_slice(&buffer, config)
        .map_err(|e| io::Error::new(ErrorKind::InvalidData, e.to_string()))?;
    Ok(decoded)
}

/// Length of each contiguous chunk when splitting `total` items across the worker threads.
/// Never zero, so it can be passed directly to `par_chunks_mut`.
pub fn chunk_len(total: usize) -> usize {
    let threads = rayon::current_num_threads().max(1);
    total.div_ceil(threads).max(1)
}

/// Split `0..total` into at most one contiguous range per worker thread.
pub fn partition(total: usize) -> Vec<std::ops::Range<usize>> {
    let chunk = chunk_len(total);

    (0..total)
        .step_by(chunk)
        .map(|start| start..(start + chunk).min(total))
        .collect()
}
