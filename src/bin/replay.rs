//! A CLI harness: feeds an escape-sequence transcript through
//! [`termgfx_core::host::GraphicsHost`] and prints whatever response
//! frames and placeholder requests come back. Useful for replaying a
//! captured session or a handwritten fixture without a real terminal.

use std::fs::File;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, LevelFilter};
use simplelog::WriteLogger;

use termgfx_core::backend::{BlitRect, CellEraser, DrawBackend};
use termgfx_core::config::Config;
use termgfx_core::host::GraphicsHost;
use termgfx_core::pixel::PixelBuffer;

#[derive(Parser)]
#[command(name = "termgfx-replay", about = "Replays a Kitty graphics protocol transcript")]
struct Cli {
    /// Path to a file containing one or more `ESC _ G ... ESC \` commands.
    transcript: PathBuf,

    /// Cell width in pixels, used to size/scale any placement created.
    #[arg(long, default_value_t = 8)]
    cw: u32,

    /// Cell height in pixels.
    #[arg(long, default_value_t = 16)]
    ch: u32,

    #[arg(long)]
    debug: bool,

    #[arg(long, default_value = "termgfx-replay.log")]
    log_file: PathBuf,
}

/// The harness has no real terminal grid to walk; `d` commands are
/// acknowledged but erase nothing.
#[derive(Default)]
struct ReplayGrid;

impl CellEraser for ReplayGrid {
    fn for_each_image_cell(&mut self, _visit: &mut dyn FnMut(u32, u32, u32, u32, bool) -> bool) {}
}

/// The harness has no real drawable surface; it just logs what would have
/// been blitted.
struct ReplayDrawer;

impl DrawBackend for ReplayDrawer {
    fn blit(&mut self, rect: BlitRect, pixels: &PixelBuffer) {
        debug!(
            "blit {}x{} at ({},{}) reverse={} ({} source pixels)",
            rect.width,
            rect.height,
            rect.x_pix,
            rect.y_pix,
            rect.reverse,
            pixels.pixels.len()
        );
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Splits a transcript into the bodies of its `ESC _ G ... ESC \` commands,
/// keeping the leading `G` each body needs per §6's wire contract (it's
/// `parse_command`'s job to validate/strip that sentinel, not the harness's).
fn extract_commands(data: &[u8]) -> Vec<Vec<u8>> {
    const START: &[u8] = b"\x1b_";
    const END: &[u8] = b"\x1b\\";
    let mut commands = Vec::new();
    let mut pos = 0;
    while let Some(start_rel) = find_subslice(&data[pos..], START) {
        let body_start = pos + start_rel + START.len();
        let Some(end_rel) = find_subslice(&data[body_start..], END) else {
            break;
        };
        let body_end = body_start + end_rel;
        commands.push(data[body_start..body_end].to_vec());
        pos = body_end + END.len();
    }
    commands
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    WriteLogger::init(
        if cli.debug { LevelFilter::Debug } else { LevelFilter::Info },
        simplelog::Config::default(),
        File::create(&cli.log_file).with_context(|| format!("creating log file {}", cli.log_file.display()))?,
    )?;

    let mut host = GraphicsHost::init(Config::load_default())?;
    host.debug_mode = cli.debug;
    host.start_drawing(cli.cw, cli.ch);

    let data = std::fs::read(&cli.transcript)
        .with_context(|| format!("reading transcript {}", cli.transcript.display()))?;

    let mut grid = ReplayGrid;
    let mut drawer = ReplayDrawer;
    let mut command_count = 0usize;

    for body in extract_commands(&data) {
        command_count += 1;
        let result = host.parse_command(&body, &mut grid);
        if let Some(response) = &result.response {
            print!("{response}");
        }
        if let Some(placeholder) = &result.create_placeholder {
            println!(
                "\n[placeholder image={} placement={} cols={} rows={} do_not_move_cursor={}]",
                placeholder.image_id,
                placeholder.placement_id,
                placeholder.columns,
                placeholder.rows,
                placeholder.do_not_move_cursor
            );
        }
    }

    host.finish_drawing(&mut drawer);
    let dump = host.dump_state();
    eprintln!(
        "replayed {command_count} command(s): {} image(s), {} placement(s), {} disk byte(s), {} RAM byte(s)",
        dump.image_count, dump.placement_count, dump.tracked_disk_total, dump.tracked_ram_total
    );

    host.deinit();
    Ok(())
}
