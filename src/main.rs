//! Headless driver.
//!
//! `sph_march [run|render|save|load] [surface 0/1] [phong 0/1]`

use std::{
    fs::OpenOptions,
    io::{BufWriter, ErrorKind},
    path::{Path, PathBuf},
    time::Instant,
};

use anyhow::{bail, Context};
use log::{info, warn};
use sph_march::{
    playback::{FrameReader, FrameWriter, IDENTITY},
    Config, NormalMode, State,
};

const CONFIG_FILE: &str = "config.sph";
const FRAME_FILE: &str = "frames.sph";

// Report progress this often, in frames.
const LOG_RATIO: usize = 50;

#[derive(Clone, Copy, Debug, PartialEq)]
enum Mode {
    Run,
    Render,
    Save,
    Load,
}

impl Mode {
    fn from_arg(arg: &str) -> anyhow::Result<Self> {
        Ok(match arg {
            "run" => Self::Run,
            "render" => Self::Render,
            "save" => Self::Save,
            "load" => Self::Load,
            _ => bail!("Unknown mode: {arg}. Expected run, render, save, or load"),
        })
    }
}

fn flag(arg: Option<String>, name: &str) -> anyhow::Result<bool> {
    match arg.as_deref() {
        None | Some("1") => Ok(true),
        Some("0") => Ok(false),
        Some(v) => bail!("Invalid value for {name}: {v}. Expected 0 or 1"),
    }
}

/// Falls back to defaults if the file is missing, or can't be used.
fn load_config(path: &Path) -> Config {
    match Config::load(path) {
        Ok(cfg) => {
            info!("Loaded config from {}", path.display());
            cfg
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Config::default(),
        Err(e) => {
            warn!("Ignoring {}: {e}. Using defaults", path.display());
            Config::default()
        }
    }
}

fn simulate(config: Config, surface: bool, normals: NormalMode, save: bool) -> anyhow::Result<()> {
    let num_frames = config.num_frames;
    let mut state = State::new(config, surface, normals);

    let mut writer = if save {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(FRAME_FILE)
            .with_context(|| format!("Opening {FRAME_FILE}"))?;
        Some(FrameWriter::new(BufWriter::new(file)))
    } else {
        None
    };

    let start = Instant::now();

    for t in 0..num_frames {
        state.step();

        if let Some(w) = &mut writer {
            w.write(&state.frame(IDENTITY, IDENTITY))?;
        }

        if t % LOG_RATIO == 0 {
            info!(
                "Frame {t}. T: {:.3}. Triangles: {}",
                state.time_elapsed,
                state.surface.len() / 3
            );
        }
    }

    info!(
        "Ran {num_frames} frames in {}ms",
        start.elapsed().as_millis()
    );

    if let Some(w) = writer {
        let n = w.frames_written();
        w.finish()?;
        info!("Appended {n} frames to {FRAME_FILE}");
    }

    Ok(())
}

fn replay(path: &Path) -> anyhow::Result<()> {
    let reader = FrameReader::open(path).with_context(|| format!("Opening {}", path.display()))?;

    let mut loaded = 0;
    for (i, frame) in reader.enumerate() {
        match frame {
            Ok(frame) => {
                loaded += 1;
                info!(
                    "Frame {i}. T: {:.3}. Particles: {}. Triangles: {}",
                    frame.header.timestamp,
                    frame.particles.len(),
                    frame.num_triangles()
                );
            }
            Err(e) => warn!("Skipping frame {i}: {e}"),
        }
    }

    info!("Loaded {loaded} frames from {}", path.display());
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = std::env::args().skip(1);

    let mode = match args.next() {
        Some(m) => Mode::from_arg(&m)?,
        None => Mode::Run,
    };
    let surface = flag(args.next(), "surface")?;
    let normals = if flag(args.next(), "phong")? {
        NormalMode::Smooth
    } else {
        NormalMode::Flat
    };

    match mode {
        Mode::Load => replay(&PathBuf::from(FRAME_FILE)),
        Mode::Run | Mode::Render | Mode::Save => {
            let config = load_config(Path::new(CONFIG_FILE));
            simulate(config, surface, normals, mode == Mode::Save)
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn unusable_config_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let default_h = Config::default().h;

        assert_eq!(load_config(&dir.path().join("missing.sph")).h, default_h);

        let garbage = dir.path().join("garbage.sph");
        std::fs::write(&garbage, [0xff; 5]).unwrap();
        assert_eq!(load_config(&garbage).h, default_h);

        let good = dir.path().join("good.sph");
        Config {
            h: 0.08,
            ..Default::default()
        }
        .save(&good)
        .unwrap();
        assert_eq!(load_config(&good).h, 0.08);
    }

    #[test]
    fn parses_modes_and_flags() {
        assert_eq!(Mode::from_arg("save").unwrap(), Mode::Save);
        assert!(Mode::from_arg("fly").is_err());

        assert!(flag(None, "surface").unwrap());
        assert!(!flag(Some("0".to_owned()), "phong").unwrap());
        assert!(flag(Some("2".to_owned()), "phong").is_err());
    }
}
