//! Command-line configuration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use crate::cube::{Cube, CubeError, CubeSnapshot, CubeSpec, SolutionCondition, MAX_EDGE_LENGTH};

#[derive(Parser, Debug, Clone)]
#[command(name = "cubelab")]
#[command(about = "Run cube programs in a sandbox and browse every change they make")]
pub struct LabConfig {
    /// Number of slices along each edge of the cube
    #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u8).range(1..=MAX_EDGE_LENGTH as i64))]
    pub edge_length: u8,

    /// When the cube counts as solved: `strict` (home colours) or `uniform` (any single colour per face)
    #[arg(long, default_value = "strict")]
    pub solution: SolutionCondition,

    /// Duration of one animated quarter turn in milliseconds
    #[arg(long, default_value_t = 120)]
    pub animation_ms: u64,

    /// Program file to load at startup (run immediately when headless)
    #[arg(long)]
    pub program: Option<PathBuf>,

    /// Apply program moves without animation
    #[arg(long)]
    pub fast: bool,

    /// Run the program without the terminal UI and exit with its outcome
    #[arg(long, requires = "program")]
    pub headless: bool,

    /// Default log filter; `RUST_LOG` takes precedence
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl LabConfig {
    pub fn animation(&self) -> Duration {
        Duration::from_millis(self.animation_ms)
    }

    /// Builds the solved shared cube this configuration describes.
    pub fn build_cube(&self) -> Result<Arc<Cube>, CubeError> {
        let spec = CubeSpec::new(self.edge_length)?;
        let cube = Cube::new(spec, self.solution, CubeSnapshot::solved(spec))?.with_animation(self.animation());
        Ok(Arc::new(cube))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_describe_an_animated_three_cube() {
        let config = LabConfig::try_parse_from(["cubelab"]).unwrap();
        assert_eq!(config.edge_length, 3);
        assert_eq!(config.solution, SolutionCondition::Strict);
        assert_eq!(config.animation(), Duration::from_millis(120));
        assert!(!config.fast && !config.headless);

        let cube = config.build_cube().unwrap();
        assert!(cube.is_solved());
    }

    #[test]
    fn rejects_out_of_range_edges_and_headless_without_program() {
        assert!(LabConfig::try_parse_from(["cubelab", "--edge-length", "8"]).is_err());
        assert!(LabConfig::try_parse_from(["cubelab", "--edge-length", "0"]).is_err());
        assert!(LabConfig::try_parse_from(["cubelab", "--headless"]).is_err());

        let config =
            LabConfig::try_parse_from(["cubelab", "--solution", "uniform", "--headless", "--program", "demo.cube"])
                .unwrap();
        assert_eq!(config.solution, SolutionCondition::Uniform);
    }
}
