use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "tether-sync")]
#[command(
    about = "Tether to a camera, download every new photo and remove it from the device",
    long_about = None
)]
pub struct Cli {
    /// Local directory that receives downloaded files (created if missing)
    pub target_dir: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_exactly_one_target() {
        assert!(Cli::try_parse_from(["tether-sync"]).is_err());
        assert!(Cli::try_parse_from(["tether-sync", "a", "b"]).is_err());

        let cli = Cli::try_parse_from(["tether-sync", "/srv/photos"]).unwrap();
        assert_eq!(cli.target_dir, PathBuf::from("/srv/photos"));
    }
}
