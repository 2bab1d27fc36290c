use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bufferq::extra_data::BufferExtraData;
use bufferq::fence::{FenceSignal, FenceTimeline};
use bufferq::memory::{BufferUsage, ShmAllocator};
use bufferq::rpc::RemoteProducer;
use bufferq::surface::ConsumerSurface;
use bufferq::{BufferFlushConfig, BufferRequestConfig, PixelFormat, Rect, SurfaceError};

use anyhow::{anyhow, Context};
use clap::{Arg, Command};
use nix::unistd::getpid;

/// Fill the first bytes of a frame with its number, so the consumer can check
/// it got the right content.
fn frame_header(frame: u32) -> [u8; 8] {
    let mut header = [0u8; 8];
    header[..4].copy_from_slice(b"FRME");
    header[4..].copy_from_slice(&frame.to_le_bytes());
    header
}

fn produce(
    producer: &RemoteProducer,
    config: BufferRequestConfig,
    num_frames: u32,
    lets_quit: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    for frame in 0..num_frames {
        if lets_quit.load(Ordering::SeqCst) {
            break;
        }

        let requested = match producer.request_buffer(&config) {
            Ok(requested) => requested,
            Err(SurfaceError::NoConsumer) => break,
            Err(SurfaceError::NoBuffer) if lets_quit.load(Ordering::SeqCst) => break,
            Err(e) => return Err(e).context("Failed to request buffer"),
        };
        requested
            .fence
            .wait(3000)
            .map_err(|e| anyhow!("Release fence of buffer {}: {}", requested.seq_num(), e))?;

        requested
            .buffer
            .write_at(0, &frame_header(frame))
            .context("Failed to write frame")?;

        let mut extra_data = requested.extra_data;
        extra_data.set("frame", frame as i32)?;

        // The fence of a real producer would be signaled by the GPU.
        let rendering_done = FenceSignal::new()?;
        let flush_config = BufferFlushConfig {
            damage: Rect::new(0, 0, config.width, config.height),
            timestamp: 0,
        };
        producer.flush_buffer(
            requested.buffer.seq_num(),
            extra_data,
            Arc::new(rendering_done.fence("render")?),
            &flush_config,
        )?;
        rendering_done.signal()?;
    }

    Ok(())
}

fn main() {
    env_logger::init();

    let matches = Command::new("Buffer queue producer/consumer")
        .arg(
            Arg::new("num_frames")
                .long("frames")
                .takes_value(true)
                .default_value("100")
                .help("Number of frames to produce"),
        )
        .arg(
            Arg::new("queue_size")
                .long("queue_size")
                .takes_value(true)
                .default_value("3")
                .help("Number of buffers in the queue"),
        )
        .arg(
            Arg::new("frame_size")
                .long("frame_size")
                .takes_value(true)
                .default_value("640x480")
                .help("Size of the frames to produce (e.g. \"640x480\")"),
        )
        .arg(
            Arg::new("dump")
                .long("dump")
                .help("Dump the state of the queue before exiting"),
        )
        .get_matches();

    let num_frames: u32 = matches
        .value_of("num_frames")
        .unwrap_or("100")
        .parse()
        .expect("Invalid value for frames");
    let queue_size: u32 = matches
        .value_of("queue_size")
        .unwrap_or("3")
        .parse()
        .expect("Invalid value for queue_size");
    let frame_size = matches
        .value_of("frame_size")
        .map(|s| {
            const ERROR_MSG: &str = "Invalid parameter for frame_size";
            let split: Vec<&str> = s.split('x').collect();
            if split.len() != 2 {
                panic!("{}", ERROR_MSG);
            }
            let width: i32 = split[0].parse().expect(ERROR_MSG);
            let height: i32 = split[1].parse().expect(ERROR_MSG);

            (width, height)
        })
        .unwrap();

    let lets_quit = Arc::new(AtomicBool::new(false));
    // Setup the Ctrl+c handler.
    {
        let lets_quit_handler = lets_quit.clone();
        ctrlc::set_handler(move || {
            lets_quit_handler.store(true, Ordering::SeqCst);
        })
        .expect("Failed to set Ctrl-C handler.");
    }

    let surface = ConsumerSurface::new("demo", false, Arc::new(ShmAllocator::new()));
    let consumer = surface.consumer();
    consumer
        .set_queue_size(queue_size)
        .expect("Invalid queue size");
    consumer
        .set_default_width_and_height(frame_size.0, frame_size.1)
        .expect("Invalid frame size");

    let (available_tx, available_rx) = mpsc::channel();
    let available_tx = Mutex::new(available_tx);
    consumer.register_consumer_listener(Arc::new(move || {
        let _ = available_tx.lock().unwrap().send(());
    }));

    let config = BufferRequestConfig {
        usage: BufferUsage::CPU_READ | BufferUsage::CPU_WRITE,
        timeout: 1000,
        ..BufferRequestConfig::from((PixelFormat::Rgba8888, frame_size))
    };
    let producer = Arc::new(RemoteProducer::new(surface.producer(), getpid()));
    let producer_thread = {
        let producer = Arc::clone(&producer);
        let lets_quit = Arc::clone(&lets_quit);
        thread::Builder::new()
            .name("producer".into())
            .spawn(move || produce(&producer, config, num_frames, lets_quit))
            .expect("Failed to spawn producer thread")
    };

    let mut release_fences = FenceTimeline::new(queue_size as usize);
    let start_time = Instant::now();
    let mut frame_counter = 0u32;
    while frame_counter < num_frames && !lets_quit.load(Ordering::SeqCst) {
        match available_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(()) => (),
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }

        let acquired = consumer.acquire_buffer().expect("Failed to acquire buffer");
        acquired
            .fence
            .wait(3000)
            .expect("Rendering fence did not signal");

        let mut header = [0u8; 8];
        acquired
            .buffer
            .read_at(0, &mut header)
            .expect("Failed to read frame");
        let extra_data: BufferExtraData = acquired.buffer.extra_data();
        let frame = extra_data.get_i32("frame").expect("Missing frame number") as u32;
        if header != frame_header(frame) {
            eprintln!("\nCorrupted content in frame {}", frame);
        }

        // Signaled once the compositor is done reading the buffer.
        let reading_done = FenceSignal::new().expect("Failed to create fence");
        let release_fence = Arc::new(reading_done.fence("read").expect("Failed to create fence"));
        consumer
            .release_buffer(acquired.seq_num(), Arc::clone(&release_fence))
            .expect("Failed to release buffer");
        release_fences
            .push(&release_fence)
            .expect("Release fence timed out");
        reading_done.signal().expect("Failed to signal fence");

        frame_counter += 1;
        let elapsed = start_time.elapsed();
        let fps = frame_counter as f32 / elapsed.as_millis().max(1) as f32 * 1000.0;
        print!(
            "\rConsumed frame {:#5}, buffer: {:#4}, timestamp: {:#16}, fps: {:#8.2}",
            frame,
            acquired.seq_num(),
            acquired.timestamp,
            fps,
        );
        io::stdout().flush().unwrap();
    }
    println!();

    lets_quit.store(true, Ordering::SeqCst);
    match producer_thread.join() {
        Ok(Ok(())) => (),
        Ok(Err(e)) => eprintln!("Producer failed: {:#}", e),
        Err(_) => eprintln!("Producer thread panicked"),
    }

    if matches.is_present("dump") {
        print!("{}", consumer.dump());
    }

    if let Err(e) = producer.disconnect() {
        eprintln!("Failed to disconnect producer: {}", e);
    }
}

