//! Configuration for the scrim compositor.
//!
//! The config file is KDL. Parsing produces plain data; interpretation
//! (easing curves, backend selection, output layout) happens in the
//! compositor crate.

use std::path::Path;
use std::str::FromStr;

use miette::{miette, Context, IntoDiagnostic};
use tracing::warn;

#[derive(knuffel::Decode, Debug, Default, Clone, PartialEq)]
pub struct Config {
    #[knuffel(children(name = "output"))]
    pub outputs: Vec<OutputConfig>,
    #[knuffel(child, default)]
    pub animations: Animations,
    #[knuffel(child, default)]
    pub effects: Effects,
    #[knuffel(child, default)]
    pub renderer: Renderer,
    #[knuffel(child, default)]
    pub debug: Debug,
}

#[derive(knuffel::Decode, Debug, Clone, PartialEq)]
pub struct OutputConfig {
    #[knuffel(argument)]
    pub name: String,
    #[knuffel(child)]
    pub off: bool,
    #[knuffel(child)]
    pub position: Option<Position>,
    #[knuffel(child, unwrap(argument))]
    pub scale: Option<f64>,
    #[knuffel(child, unwrap(argument, str))]
    pub mode: Option<Mode>,
    #[knuffel(child)]
    pub variable_refresh_rate: bool,
}

#[derive(knuffel::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    #[knuffel(property)]
    pub x: i32,
    #[knuffel(property)]
    pub y: i32,
}

/// Output mode: `1920x1080` or `1920x1080@60.000`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mode {
    pub width: u16,
    pub height: u16,
    pub refresh: Option<f64>,
}

impl FromStr for Mode {
    type Err = miette::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (resolution, refresh) = match s.split_once('@') {
            Some((res, refresh)) => (res, Some(refresh)),
            None => (s, None),
        };

        let (width, height) = resolution
            .split_once('x')
            .ok_or_else(|| miette!("resolution must be formatted as WxH"))?;

        let width = width
            .parse()
            .into_diagnostic()
            .context("error parsing width")?;
        let height = height
            .parse()
            .into_diagnostic()
            .context("error parsing height")?;

        let refresh = refresh
            .map(str::parse)
            .transpose()
            .into_diagnostic()
            .context("error parsing refresh rate")?;
        if let Some(refresh) = refresh {
            if refresh <= 0. {
                return Err(miette!("refresh rate must be positive"));
            }
        }

        Ok(Self {
            width,
            height,
            refresh,
        })
    }
}

#[derive(knuffel::Decode, Debug, Clone, PartialEq)]
pub struct Animations {
    #[knuffel(child)]
    pub off: bool,
    #[knuffel(child, unwrap(argument), default = 1.)]
    pub slowdown: f64,
    #[knuffel(child, default = Animation::default_open())]
    pub window_open: Animation,
    #[knuffel(child, default = Animation::default_close())]
    pub window_close: Animation,
    #[knuffel(child, default = Animation::default_move())]
    pub window_move: Animation,
}

impl Default for Animations {
    fn default() -> Self {
        Self {
            off: false,
            slowdown: 1.,
            window_open: Animation::default_open(),
            window_close: Animation::default_close(),
            window_move: Animation::default_move(),
        }
    }
}

#[derive(knuffel::Decode, Debug, Clone, Copy, PartialEq)]
pub struct Animation {
    #[knuffel(child, unwrap(argument))]
    pub duration_ms: Option<u32>,
    #[knuffel(child, unwrap(argument, str))]
    pub curve: Option<Curve>,
}

impl Animation {
    pub fn default_open() -> Self {
        Self {
            duration_ms: Some(150),
            curve: Some(Curve::EaseOutExpo),
        }
    }

    pub fn default_close() -> Self {
        Self {
            duration_ms: Some(150),
            curve: Some(Curve::EaseOutQuad),
        }
    }

    pub fn default_move() -> Self {
        Self {
            duration_ms: Some(250),
            curve: Some(Curve::EaseOutCubic),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Curve {
    Linear,
    EaseOutQuad,
    EaseOutCubic,
    EaseOutExpo,
}

impl FromStr for Curve {
    type Err = miette::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linear" => Ok(Self::Linear),
            "ease-out-quad" => Ok(Self::EaseOutQuad),
            "ease-out-cubic" => Ok(Self::EaseOutCubic),
            "ease-out-expo" => Ok(Self::EaseOutExpo),
            _ => Err(miette!(
                "unknown curve `{s}`; expected linear, ease-out-quad, \
                 ease-out-cubic or ease-out-expo"
            )),
        }
    }
}

#[derive(knuffel::Decode, Debug, Default, Clone, PartialEq)]
pub struct Effects {
    #[knuffel(child)]
    pub fade: Option<Fade>,
    #[knuffel(child)]
    pub zoom: Option<Zoom>,
    #[knuffel(child)]
    pub translucency: Option<Translucency>,
}

#[derive(knuffel::Decode, Debug, Clone, Copy, PartialEq)]
pub struct Fade {
    #[knuffel(child, unwrap(argument), default = 60)]
    pub position: i32,
}

#[derive(knuffel::Decode, Debug, Clone, Copy, PartialEq)]
pub struct Zoom {
    #[knuffel(child, unwrap(argument), default = 10)]
    pub position: i32,
    #[knuffel(child, unwrap(argument), default = 2.)]
    pub factor: f64,
}

#[derive(knuffel::Decode, Debug, Clone, Copy, PartialEq)]
pub struct Translucency {
    #[knuffel(child, unwrap(argument), default = 70)]
    pub position: i32,
    #[knuffel(child, unwrap(argument), default = 0.8)]
    pub opacity: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderBackend {
    Gpu,
    Software,
}

impl Default for RenderBackend {
    fn default() -> Self {
        Self::Gpu
    }
}

impl FromStr for RenderBackend {
    type Err = miette::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gpu" => Ok(Self::Gpu),
            "software" => Ok(Self::Software),
            _ => Err(miette!("unknown backend `{s}`; expected gpu or software")),
        }
    }
}

#[derive(knuffel::Decode, Debug, Default, Clone, PartialEq)]
pub struct Renderer {
    #[knuffel(child, unwrap(argument, str), default)]
    pub backend: RenderBackend,
}

#[derive(knuffel::Decode, Debug, Default, Clone, PartialEq)]
pub struct Debug {
    #[knuffel(child)]
    pub disable_occlusion_culling: bool,
    #[knuffel(child)]
    pub disable_scanout_fast_path: bool,
    #[knuffel(child)]
    pub draw_damage: bool,
    #[knuffel(child, unwrap(argument), default = 0)]
    pub fail_frame_submissions: u32,
}

impl Config {
    pub fn load(path: &Path) -> miette::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .into_diagnostic()
            .with_context(|| format!("error reading {path:?}"))?;

        let config = Self::parse(
            path.file_name()
                .and_then(|name| name.to_str())
                .unwrap_or("config.kdl"),
            &contents,
        )
        .context("error parsing")?;

        Ok(config)
    }

    pub fn parse(filename: &str, text: &str) -> Result<Self, knuffel::Error> {
        let mut config = knuffel::parse::<Config>(filename, text)?;

        for output in &mut config.outputs {
            if let Some(scale) = &mut output.scale {
                if !scale.is_finite() || *scale <= 0. {
                    warn!("output scale must be positive, ignoring: {scale}");
                    output.scale = None;
                }
            }
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn do_parse(text: &str) -> Config {
        Config::parse("test.kdl", text)
            .map_err(miette::Report::new)
            .unwrap()
    }

    #[test]
    fn parse_full() {
        let parsed = do_parse(
            r##"
            output "DP-2" {
                position x=1920 y=0
                scale 2.0
                mode "1920x1080@59.981"
                variable-refresh-rate
            }

            animations {
                slowdown 2.0
                window-open {
                    duration-ms 200
                    curve "ease-out-cubic"
                }
            }

            effects {
                fade
                zoom {
                    position 5
                    factor 3.0
                }
            }

            renderer {
                backend "software"
            }

            debug {
                disable-occlusion-culling
                fail-frame-submissions 2
            }
            "##,
        );

        assert_eq!(
            parsed,
            Config {
                outputs: vec![OutputConfig {
                    name: "DP-2".to_owned(),
                    off: false,
                    position: Some(Position { x: 1920, y: 0 }),
                    scale: Some(2.),
                    mode: Some(Mode {
                        width: 1920,
                        height: 1080,
                        refresh: Some(59.981),
                    }),
                    variable_refresh_rate: true,
                }],
                animations: Animations {
                    off: false,
                    slowdown: 2.,
                    window_open: Animation {
                        duration_ms: Some(200),
                        curve: Some(Curve::EaseOutCubic),
                    },
                    ..Default::default()
                },
                effects: Effects {
                    fade: Some(Fade { position: 60 }),
                    zoom: Some(Zoom {
                        position: 5,
                        factor: 3.,
                    }),
                    translucency: None,
                },
                renderer: Renderer {
                    backend: RenderBackend::Software,
                },
                debug: Debug {
                    disable_occlusion_culling: true,
                    disable_scanout_fast_path: false,
                    draw_damage: false,
                    fail_frame_submissions: 2,
                },
            },
        );
    }

    #[test]
    fn parse_empty() {
        assert_eq!(do_parse(""), Config::default());
    }

    #[test]
    fn parse_mode() {
        assert_eq!(
            "1920x1080".parse::<Mode>().unwrap(),
            Mode {
                width: 1920,
                height: 1080,
                refresh: None,
            },
        );
        assert!("1920x".parse::<Mode>().is_err());
        assert!("1920x1080@0".parse::<Mode>().is_err());
    }

    #[test]
    fn invalid_scale_is_dropped() {
        let parsed = do_parse(
            r#"
            output "X-1" {
                scale -1.0
            }
            "#,
        );
        assert_eq!(parsed.outputs[0].scale, None);
    }
}
