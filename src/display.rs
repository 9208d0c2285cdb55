//! Rendering a single layer to an image file and opening it in a viewer.
use crate::adapter::{LayerAdapter, Strategy};
use crate::map::{Layer, Map};
use crate::query::{GeometryFieldSelector, QuerySet};
use crate::style::{Color, Style};
use crate::{Error, Renderer};

use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Instant;

use tracing::{info, warn};

/// Prefix for images written to the temp directory.
pub const TEMP_PREFIX: &str = "geoquery-map-";

/// Name the default style is registered under.
pub const DEFAULT_STYLE_NAME: &str = "style";

/// Viewers tried in order on Linux when no application is given.
const LINUX_VIEWERS: [&str; 2] = ["xdg-open", "gthumb"];
/// Tried after every other Linux viewer failed; its failure is returned.
const LINUX_LAST_VIEWER: &str = "display";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShowOptions {
    pub width: u32,
    pub height: u32,
    /// Where to write the image; a temp file when unset.
    pub filename: Option<PathBuf>,
    /// Application to open the image with instead of the platform default.
    pub app: Option<String>,
    pub open: bool,
}

impl Default for ShowOptions {
    fn default() -> Self {
        ShowOptions {
            width: 400,
            height: 300,
            filename: None,
            app: None,
            open: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Platform {
    Windows,
    Linux,
    MacOs,
    Other(String),
}

impl Platform {
    pub fn current() -> Platform {
        match std::env::consts::OS {
            "windows" => Platform::Windows,
            "linux" => Platform::Linux,
            "macos" => Platform::MacOs,
            other => Platform::Other(other.to_string()),
        }
    }
}

/// Starts external programs.
pub trait Launcher {
    fn launch(&self, program: &str, args: &[&str]) -> io::Result<()>;
}

/// Spawns the program and leaves it running.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemLauncher;

impl Launcher for SystemLauncher {
    fn launch(&self, program: &str, args: &[&str]) -> io::Result<()> {
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map(|_| ())
    }
}

/// Creates an empty, uniquely named `.png` in the temp directory and keeps it.
pub fn temp_png_path() -> Result<PathBuf, Error> {
    let file = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .suffix(".png")
        .tempfile()?;
    let (_, path) = file.keep().map_err(|e| e.error)?;
    Ok(path)
}

/// Opens an image with the platform's viewer, or with `app` where supported.
pub fn open_image<L: Launcher + ?Sized>(
    path: &Path,
    app: Option<&str>,
    launcher: &L,
) -> Result<(), Error> {
    open_image_on(&Platform::current(), path, app, launcher)
}

pub fn open_image_on<L: Launcher + ?Sized>(
    platform: &Platform,
    path: &Path,
    app: Option<&str>,
    launcher: &L,
) -> Result<(), Error> {
    let file = path.to_string_lossy().into_owned();
    let run = |program: &str, args: &[&str]| {
        launcher.launch(program, args).map_err(|source| Error::Viewer {
            program: program.to_string(),
            source,
        })
    };

    match platform {
        Platform::Windows => {
            if app.is_some() {
                return Err(Error::ViewerOverrideUnsupported);
            }
            let windows_path = file.replace('/', "\\");
            run("cmd", &["/C", "start", "", windows_path.as_str()])
        }
        Platform::Linux => {
            if let Some(app) = app {
                return run(app, &[file.as_str()]);
            }
            for viewer in LINUX_VIEWERS {
                match launcher.launch(viewer, &[file.as_str()]) {
                    Ok(()) => return Ok(()),
                    Err(e) => warn!("Unable to open {} with {}: {}", file, viewer, e),
                }
            }
            run(LINUX_LAST_VIEWER, &[file.as_str()])
        }
        Platform::MacOs => match app {
            Some(app) => run("open", &[file.as_str(), "-a", app]),
            None => run("open", &[file.as_str()]),
        },
        Platform::Other(name) => Err(Error::UnsupportedPlatform(name.clone())),
    }
}

/// Renders one layer with one style to a file, then optionally opens it.
///
/// The layer gets the style under [`DEFAULT_STYLE_NAME`] and the map is zoomed to
/// the layer's extent.
pub async fn show<R, L>(
    mut layer: Layer,
    style: Style,
    options: &ShowOptions,
    renderer: &R,
    launcher: &L,
) -> Result<(Map, PathBuf), Error>
where
    R: Renderer + ?Sized,
    L: Launcher + ?Sized,
{
    let mut map = Map::new(options.width, options.height, layer.srs.clone());
    map.background = Color::TRANSPARENT;
    layer.styles.push(DEFAULT_STYLE_NAME.to_string());
    map.append_style(DEFAULT_STYLE_NAME, style);
    map.add_layer(layer);
    map.zoom_all();

    let path = match &options.filename {
        Some(path) => path.clone(),
        None => temp_png_path()?,
    };
    renderer.render_to_file(&map, &path).await?;

    if options.open {
        open_image(&path, options.app.as_deref(), launcher)?;
    }
    Ok((map, path))
}

/// Builds a layer straight from a query set and shows it, logging how long
/// the whole round trip took.
pub async fn show_query<R: Renderer + ?Sized>(
    qs: &dyn QuerySet,
    strategy: &Strategy,
    renderer: &R,
    options: &ShowOptions,
) -> Result<(Map, PathBuf), Error> {
    let start = Instant::now();
    let adapter = LayerAdapter::new(qs, &GeometryFieldSelector::Infer)?;
    let shown = adapter.show(strategy, renderer, options).await?;
    info!(
        model = %qs.meta().name,
        path = %shown.1.display(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Rendered query set"
    );
    Ok(shown)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::RefCell;

    /// Records every launch and fails for the listed programs.
    #[derive(Default)]
    struct Recorder {
        failing: Vec<&'static str>,
        launched: RefCell<Vec<Vec<String>>>,
    }

    impl Launcher for Recorder {
        fn launch(&self, program: &str, args: &[&str]) -> io::Result<()> {
            let mut call = vec![program.to_string()];
            call.extend(args.iter().map(|a| a.to_string()));
            self.launched.borrow_mut().push(call);

            if self.failing.iter().any(|f| *f == program) {
                Err(io::Error::new(io::ErrorKind::NotFound, program.to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn programs(recorder: &Recorder) -> Vec<String> {
        recorder
            .launched
            .borrow()
            .iter()
            .map(|call| call[0].clone())
            .collect()
    }

    #[test]
    fn test_linux_uses_first_working_viewer() {
        let recorder = Recorder {
            failing: vec!["xdg-open"],
            ..Recorder::default()
        };

        open_image_on(&Platform::Linux, Path::new("/tmp/a.png"), None, &recorder).unwrap();
        assert_eq!(vec!["xdg-open", "gthumb"], programs(&recorder));
        assert_eq!(
            vec!["gthumb", "/tmp/a.png"],
            recorder.launched.borrow()[1]
        );
    }

    #[test]
    fn test_linux_last_viewer_failure_is_fatal() {
        let recorder = Recorder {
            failing: vec!["xdg-open", "gthumb", "display"],
            ..Recorder::default()
        };

        match open_image_on(&Platform::Linux, Path::new("/tmp/a.png"), None, &recorder) {
            Err(Error::Viewer { program, .. }) => assert_eq!("display", program),
            other => panic!("expected a viewer error, got {:?}", other),
        }
        assert_eq!(vec!["xdg-open", "gthumb", "display"], programs(&recorder));
    }

    #[test]
    fn test_linux_app_is_honored_exactly() {
        let recorder = Recorder {
            failing: vec!["eog"],
            ..Recorder::default()
        };

        assert!(open_image_on(&Platform::Linux, Path::new("/tmp/a.png"), Some("eog"), &recorder).is_err());
        assert_eq!(vec!["eog"], programs(&recorder));
    }

    #[test]
    fn test_windows_rejects_app_override() {
        let recorder = Recorder::default();

        assert!(matches!(
            open_image_on(&Platform::Windows, Path::new("C:/maps/a.png"), Some("mspaint"), &recorder),
            Err(Error::ViewerOverrideUnsupported)
        ));
        assert!(programs(&recorder).is_empty());

        open_image_on(&Platform::Windows, Path::new("C:/maps/a.png"), None, &recorder).unwrap();
        assert_eq!(
            vec!["cmd", "/C", "start", "", "C:\\maps\\a.png"],
            recorder.launched.borrow()[0]
        );
    }

    #[test]
    fn test_macos_open() {
        let recorder = Recorder::default();

        open_image_on(&Platform::MacOs, Path::new("/tmp/a.png"), Some("Preview"), &recorder).unwrap();
        assert_eq!(
            vec!["open", "/tmp/a.png", "-a", "Preview"],
            recorder.launched.borrow()[0]
        );
    }

    #[test]
    fn test_unknown_platform() {
        let recorder = Recorder::default();

        assert!(matches!(
            open_image_on(&Platform::Other(String::from("plan9")), Path::new("a.png"), None, &recorder),
            Err(Error::UnsupportedPlatform(_))
        ));
    }

    #[test]
    fn test_temp_png_path() {
        let path = temp_png_path().unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();

        assert!(name.starts_with(TEMP_PREFIX));
        assert!(name.ends_with(".png"));
        assert!(path.exists());
        std::fs::remove_file(path).unwrap();
    }
}
