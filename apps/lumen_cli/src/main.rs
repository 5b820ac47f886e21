//! lumen - 命令行播放器
//!
//! 顺序播放文件（无缝切歌），或播放命名管道里的 PCM 流

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use lumen_player::{AudioContext, PipelineConfig, Tick, BAND_COUNT};

const TICK: Duration = Duration::from_millis(20);

struct Options {
    config: Option<PathBuf>,
    eq: Vec<i32>,
    volume: Option<i32>,
    inputs: Vec<PathBuf>,
}

fn usage(program: &str) -> ! {
    eprintln!("Usage:");
    eprintln!("  {} play [options] <file>...", program);
    eprintln!("  {} stream [options] <fifo>", program);
    eprintln!("  {} info <file>   # prints JSON (title/artist/album/duration)", program);
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --config <file.json>   pipeline settings");
    eprintln!("  --eq <db,db,db,db,db>  band gains for 60/250/1k/4k/16k Hz");
    eprintln!("  --volume <0-100>");
    std::process::exit(1);
}

fn parse_options(program: &str, args: &[String]) -> Options {
    let mut options = Options {
        config: None,
        eq: Vec::new(),
        volume: None,
        inputs: Vec::new(),
    };

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => match iter.next() {
                Some(path) => options.config = Some(PathBuf::from(path)),
                None => usage(program),
            },
            "--eq" => {
                let Some(list) = iter.next() else { usage(program) };
                options.eq = list
                    .split(',')
                    .map(|v| v.trim().parse().unwrap_or_else(|_| usage(program)))
                    .collect();
                if options.eq.len() > BAND_COUNT {
                    eprintln!("--eq takes at most {} values", BAND_COUNT);
                    std::process::exit(1);
                }
            }
            "--volume" => {
                let Some(v) = iter.next() else { usage(program) };
                options.volume = Some(v.parse().unwrap_or_else(|_| usage(program)));
            }
            _ if arg.starts_with("--") => {
                eprintln!("Unknown option: {}", arg);
                usage(program);
            }
            _ => options.inputs.push(PathBuf::from(arg)),
        }
    }
    options
}

fn build_context(options: &Options) -> AudioContext {
    let config = match &options.config {
        Some(path) => match PipelineConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Failed to load config {}: {}", path.display(), e);
                std::process::exit(2);
            }
        },
        None => PipelineConfig::default(),
    };

    let mut ctx = AudioContext::new(config);
    ctx.equalizer_mut().apply_gains(&options.eq);
    if let Some(volume) = options.volume {
        ctx.engine_mut().set_volume(volume);
    }

    if let Err(e) = ctx.open_output() {
        eprintln!("Failed to open audio output: {}", e);
        std::process::exit(3);
    }
    ctx
}

fn announce(ctx: &AudioContext) {
    let info = ctx.engine().track_info();
    println!(
        "Now playing: {} - {} [{}] ({:.0}s)",
        info.artist,
        info.title,
        info.album,
        info.duration.as_secs_f64()
    );
}

/// 从 `start` 开始找第一首能打开的
fn advance_from(ctx: &mut AudioContext, files: &[PathBuf], start: usize) -> Option<usize> {
    for (i, path) in files.iter().enumerate().skip(start) {
        match ctx.advance_to(path) {
            Ok(()) => {
                announce(ctx);
                return Some(i);
            }
            Err(e) => eprintln!("Skipping {}: {}", path.display(), e),
        }
    }
    None
}

fn play(options: Options) {
    let mut ctx = build_context(&options);
    let files = options.inputs;

    let mut current = match advance_from(&mut ctx, &files, 0) {
        Some(i) => i,
        None => std::process::exit(4),
    };

    loop {
        let upcoming = files.get(current + 1).map(PathBuf::as_path);
        if ctx.update(upcoming) == Tick::TrackFinished {
            match advance_from(&mut ctx, &files, current + 1) {
                Some(i) => current = i,
                None => break,
            }
        }
        thread::sleep(TICK);
    }

    ctx.stop();
}

#[cfg(unix)]
fn stream(options: Options) {
    use std::sync::Arc;

    use lumen_player::{FifoSource, PumpStatus};

    let [fifo] = options.inputs.as_slice() else {
        eprintln!("stream takes exactly one FIFO path");
        std::process::exit(1);
    };

    let mut ctx = build_context(&options);
    let reader = ctx.stream_reader(Arc::new(FifoSource::new(fifo)));
    if let Err(e) = ctx.play_stream(reader) {
        eprintln!("Failed to start stream: {}", e);
        std::process::exit(4);
    }

    let mut last = None;
    loop {
        let tick = ctx.update(None);
        if last != Some(tick) {
            match tick {
                Tick::Stream(PumpStatus::Buffering) => println!("Buffering..."),
                Tick::Stream(PumpStatus::Playing) => println!("Playing stream"),
                Tick::Stream(PumpStatus::Stalled) => println!("Stream stalled"),
                _ => {}
            }
            last = Some(tick);
        }
        if !ctx.is_streaming() {
            println!("Stream ended");
            break;
        }
        thread::sleep(TICK);
    }
}

#[cfg(not(unix))]
fn stream(_options: Options) {
    eprintln!("stream is only supported on unix");
    std::process::exit(1);
}

fn info(path: &Path) {
    let mut ctx = AudioContext::new(PipelineConfig::default());
    match ctx.engine_mut().load(path) {
        Ok(()) => {
            let info = ctx.engine().track_info();
            let json = serde_json::json!({
                "valid": true,
                "title": info.title,
                "artist": info.artist,
                "album": info.album,
                "duration_secs": info.duration.as_secs_f64(),
            });
            println!("{}", json);
        }
        Err(e) => {
            println!(
                "{}",
                serde_json::json!({ "valid": false, "error": e.to_string() })
            );
            std::process::exit(2);
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    let program = args.first().map(String::as_str).unwrap_or("lumen");

    if args.len() < 3 {
        usage(program);
    }

    let command = args[1].as_str();
    match command {
        "play" => {
            let options = parse_options(program, &args[2..]);
            if options.inputs.is_empty() {
                usage(program);
            }
            play(options);
        }
        "stream" => stream(parse_options(program, &args[2..])),
        "info" => info(Path::new(&args[2])),
        _ => {
            eprintln!("Unknown command: {}", command);
            usage(program);
        }
    }

    log::debug!("exiting");
}
