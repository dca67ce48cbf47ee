//!
//! ## Design
//!
//! * an emulator core runs at its own emulated rate; the sound card and the
//!   terminal run at wall-clock rate. this crate is the bridge between them
//! * the core is stepped one fixed quantum (a 30Hz frame) at a time and
//!   reports pixels and samples through a Host it borrows for the step
//! * abstract display, input and sound device so can plug alternatives;
//!   starting with the kitty graphics protocol in-console and cpal
//! * no lock-step between audio and video: audio is decoupled through a
//!   bounded queue and drops samples rather than ever stalling emulation
//!
//! Model
//!
//! main
//!  |-- config, machine, display(config), input
//!  |-- audio sink(config)
//!  |    |-- sample queue           -- shared with the pacing loop, one mutex
//!  |    `-- playback thread        -- owns the device and the period buffer
//!  |         `-- loop {
//!  |               pop up to a period, pad with silence
//!  |               write_period()  -- blocks, paces audio
//!  |               underrun? recover() and carry on
//!  |             }
//!  `-- pacing loop(machine, display, input, audio sink)
//!       `-- loop {
//!             machine.step(quantum, bridge)   -- pixels, samples
//!             push samples; poll input; display.draw(framebuffer)
//!             sleep(quantum + emulated - real)
//!             scheduled one-shot actions
//!           }
pub mod config;
pub mod display;
pub mod emulator;
pub mod error;
pub mod input;
pub mod kitty;
pub mod machine;
pub mod pacing;
pub mod queue;
pub mod sink;
pub mod sound;
