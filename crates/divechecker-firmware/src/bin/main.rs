#![no_std]
#![no_main]
#![deny(
    clippy::mem_forget,
    reason = "mem::forget is generally not safe to do with esp_hal types, especially those \
    holding buffers for the duration of a data transfer."
)]
#![deny(clippy::large_stack_frames)]

use divechecker_core::app_state::{LinkState, PressureChannel};
use divechecker_core::async_i2c_bus::SharedI2cDevice;
use divechecker_core::auth::AuthSubsystem;
use divechecker_core::config::{EngineConfig, FW_VERSION, Framing, KeySource, SchedulingMode};
use divechecker_core::engine::{CooperativeEngine, IoTask, SamplingTask, start_sensor};
use divechecker_core::protocol::{Board, CommandProtocol};
use divechecker_core::sensors::Bmp280;
use divechecker_core::transport::SerialLink;
use divechecker_firmware::app_state::{
    FirmwareBoard, HwEntropy, StatusLed, create_i2c_bus, device_identity, init_settings,
    init_usb_serial, share_i2c_bus,
};
use divechecker_firmware::device_key::DeviceKey;
use divechecker_firmware::tasks::{cooperative_task, io_task, sampling_task};
use embassy_executor::Spawner;
use embassy_time::{Delay, Duration, Timer};
use esp_hal::clock::CpuClock;
use esp_hal::gpio::{Level, Output, OutputConfig};
use esp_hal::interrupt::software::SoftwareInterruptControl;
use esp_hal::rng::Rng;
use esp_hal::system::Stack;
use esp_hal::timer::timg::TimerGroup;
use esp_rtos::embassy::Executor;
use log::{info, warn};
use static_cell::StaticCell;

const ENGINE_CONFIG: EngineConfig = EngineConfig {
    scheduling: if cfg!(feature = "single-core") {
        SchedulingMode::Cooperative
    } else {
        SchedulingMode::DualContext
    },
    framing: if cfg!(feature = "sysex") {
        Framing::SysEx
    } else {
        Framing::Line
    },
    key_source: if cfg!(feature = "otp-key") {
        KeySource::Otp
    } else {
        KeySource::Compiled
    },
};

/// Stack of the app core, which only runs the sampler.
const APP_CORE_STACK_SIZE: usize = 8192;

static LINK: LinkState = LinkState::new();
static PRESSURE: PressureChannel = PressureChannel::new();
static APP_CORE_STACK: StaticCell<Stack<APP_CORE_STACK_SIZE>> = StaticCell::new();

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    rtt_target::rprintln!("PANIC: {}", info);
    loop {}
}

extern crate alloc;

// This creates a default app-descriptor required by the esp-idf bootloader.
// For more information see: <https://docs.espressif.com/projects/esp-idf/en/stable/esp32/api-reference/system/app_image_format.html#application-description>
esp_bootloader_esp_idf::esp_app_desc!();

#[allow(
    clippy::large_stack_frames,
    reason = "it's not unusual to allocate larger buffers etc. in main"
)]
#[esp_rtos::main]
async fn main(spawner: Spawner) -> ! {
    rtt_target::rtt_init_log!();

    let config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(config);

    esp_alloc::heap_allocator!(size: 32 * 1024);

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    let sw_int = SoftwareInterruptControl::new(peripherals.SW_INTERRUPT);
    esp_rtos::start(timg0.timer0);

    info!("DiveChecker {} starting ({:?})", FW_VERSION, ENGINE_CONFIG);

    // LED on while booting
    let led = Output::new(peripherals.GPIO21, Level::High, OutputConfig::default());

    let (rx, serial) = init_usb_serial(peripherals.USB_DEVICE);
    let bus = share_i2c_bus(create_i2c_bus(
        peripherals.I2C0,
        peripherals.GPIO8,
        peripherals.GPIO9,
    ));

    let mut sensor = Bmp280::new(SharedI2cDevice::new(bus), Delay);
    if let Err(e) = start_sensor(&mut sensor, &mut Delay, &LINK).await {
        warn!("Continuing without sensor: {}", e);
    }

    let mut board = FirmwareBoard::new(SharedI2cDevice::new(bus), led);
    board.set_status(StatusLed::UsbReady);

    let protocol = CommandProtocol::new(
        &LINK,
        init_settings(peripherals.FLASH),
        AuthSubsystem::new(
            DeviceKey::from_source(ENGINE_CONFIG.key_source),
            HwEntropy(Rng::new()),
        ),
        device_identity(),
        board,
    );
    let sampling = SamplingTask::new(sensor, &LINK, &PRESSURE);
    let io = IoTask::new(protocol, ENGINE_CONFIG.framing, &PRESSURE);
    let out = SerialLink::new(serial, ENGINE_CONFIG.framing);

    match ENGINE_CONFIG.scheduling {
        SchedulingMode::Cooperative => {
            spawner
                .spawn(cooperative_task(CooperativeEngine::new(sampling, io), rx, out))
                .expect("cooperative_task spawn");
        }
        SchedulingMode::DualContext => {
            esp_rtos::start_second_core(
                peripherals.CPU_CTRL,
                sw_int.software_interrupt0,
                APP_CORE_STACK.init(Stack::new()),
                move || {
                    static EXECUTOR: StaticCell<Executor> = StaticCell::new();
                    EXECUTOR.init(Executor::new()).run(|spawner| {
                        spawner
                            .spawn(sampling_task(sampling))
                            .expect("sampling_task spawn");
                    });
                },
            );
            spawner
                .spawn(io_task(io, rx, out))
                .expect("io_task spawn");
        }
    }

    loop {
        Timer::after(Duration::from_secs(60)).await;
    }
}
