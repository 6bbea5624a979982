use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForegroundWindow {
    pub fullscreen: bool,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// A window counts as fullscreen when it covers the screen exactly.
pub fn covers_screen(window: Rect, screen_width: u32, screen_height: u32) -> bool {
    window
        == Rect {
            x: 0,
            y: 0,
            width: screen_width,
            height: screen_height,
        }
}

/// Reports the foreground window. Query failures read as "not fullscreen".
pub trait ForegroundSource: Send + 'static {
    fn inspect(&mut self) -> ForegroundWindow;
}

/// Used when no window system is reachable.
#[derive(Debug, Default)]
pub struct NoForeground;

impl ForegroundSource for NoForeground {
    fn inspect(&mut self) -> ForegroundWindow {
        ForegroundWindow::default()
    }
}

pub fn system_foreground() -> Box<dyn ForegroundSource> {
    #[cfg(unix)]
    {
        Box::new(x11::X11Foreground::default())
    }
    #[cfg(not(unix))]
    {
        debug!("no foreground inspector on this platform");
        Box::new(NoForeground)
    }
}

#[cfg(unix)]
pub mod x11 {
    use anyhow::{Context, Result};
    use x11rb::connection::Connection;
    use x11rb::protocol::xproto::{Atom, AtomEnum, ConnectionExt, Window};
    use x11rb::rust_connection::RustConnection;

    use super::{ForegroundSource, ForegroundWindow, Rect, covers_screen, debug};

    struct Atoms {
        net_active_window: Atom,
        net_wm_name: Atom,
        utf8_string: Atom,
    }

    impl Atoms {
        fn new(conn: &RustConnection) -> Result<Self> {
            let intern = |name: &[u8]| -> Result<Atom> {
                Ok(conn
                    .intern_atom(false, name)
                    .with_context(|| format!("failed to intern {}", String::from_utf8_lossy(name)))?
                    .reply()
                    .with_context(|| format!("no reply interning {}", String::from_utf8_lossy(name)))?
                    .atom)
            };
            Ok(Self {
                net_active_window: intern(b"_NET_ACTIVE_WINDOW")?,
                net_wm_name: intern(b"_NET_WM_NAME")?,
                utf8_string: intern(b"UTF8_STRING")?,
            })
        }
    }

    struct Session {
        conn: RustConnection,
        root: Window,
        screen_width: u32,
        screen_height: u32,
        atoms: Atoms,
    }

    impl Session {
        fn open() -> Result<Self> {
            let (conn, screen_num) = x11rb::connect(None).context("failed to connect to X server")?;
            let screen = conn
                .setup()
                .roots
                .get(screen_num)
                .context("X server reported no screen")?;
            let root = screen.root;
            let screen_width = u32::from(screen.width_in_pixels);
            let screen_height = u32::from(screen.height_in_pixels);
            let atoms = Atoms::new(&conn)?;
            Ok(Self {
                conn,
                root,
                screen_width,
                screen_height,
                atoms,
            })
        }

        fn active_window(&self) -> Result<Option<Window>> {
            let reply = self
                .conn
                .get_property(
                    false,
                    self.root,
                    self.atoms.net_active_window,
                    AtomEnum::WINDOW,
                    0,
                    1,
                )
                .context("failed to query _NET_ACTIVE_WINDOW")?
                .reply()
                .context("no reply for _NET_ACTIVE_WINDOW")?;
            Ok(reply.value32().and_then(|mut values| values.next()).filter(|w| *w != 0))
        }

        fn rect(&self, window: Window) -> Result<Rect> {
            let geometry = self
                .conn
                .get_geometry(window)
                .context("failed to query window geometry")?
                .reply()
                .context("no reply for window geometry")?;
            let origin = self
                .conn
                .translate_coordinates(window, self.root, 0, 0)
                .context("failed to translate window coordinates")?
                .reply()
                .context("no reply for coordinate translation")?;
            Ok(Rect {
                x: i32::from(origin.dst_x),
                y: i32::from(origin.dst_y),
                width: u32::from(geometry.width),
                height: u32::from(geometry.height),
            })
        }

        fn title(&self, window: Window) -> Result<Option<String>> {
            for (property, kind) in [
                (self.atoms.net_wm_name, self.atoms.utf8_string),
                (AtomEnum::WM_NAME.into(), AtomEnum::STRING.into()),
            ] {
                let reply = self
                    .conn
                    .get_property(false, window, property, kind, 0, 1024)
                    .context("failed to query window title")?
                    .reply()
                    .context("no reply for window title")?;
                if !reply.value.is_empty() {
                    return Ok(Some(String::from_utf8_lossy(&reply.value).into_owned()));
                }
            }
            Ok(None)
        }

        fn inspect(&self) -> Result<ForegroundWindow> {
            let Some(window) = self.active_window()? else {
                return Ok(ForegroundWindow::default());
            };
            let rect = self.rect(window)?;
            Ok(ForegroundWindow {
                fullscreen: covers_screen(rect, self.screen_width, self.screen_height),
                title: self.title(window)?,
            })
        }
    }

    /// Reads the EWMH active window; reconnects lazily after failures.
    #[derive(Default)]
    pub struct X11Foreground {
        session: Option<Session>,
    }

    impl ForegroundSource for X11Foreground {
        fn inspect(&mut self) -> ForegroundWindow {
            if self.session.is_none() {
                match Session::open() {
                    Ok(session) => self.session = Some(session),
                    Err(err) => {
                        debug!("foreground inspector unavailable: {err:#}");
                        return ForegroundWindow::default();
                    }
                }
            }
            let Some(session) = self.session.as_ref() else {
                return ForegroundWindow::default();
            };
            match session.inspect() {
                Ok(window) => window,
                Err(err) => {
                    debug!("foreground query failed: {err:#}");
                    self.session = None;
                    ForegroundWindow::default()
                }
            }
        }
    }
}
