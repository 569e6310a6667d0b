use maplit::btreemap;
use tracing_subscriber::EnvFilter;

use rtiocompiler_backend::*;

fn build() -> Result<CompiledSequence> {
    let mut exp = Experiment::default();
    exp.add_device("ttl0", DeviceKind::Ttl, 0)?;
    exp.add_channel("ttl0", "ttl4", 4_000_000, ChannelState::default())?;
    exp.add_channel("ttl0", "ttl5", 2_500_000, ChannelState::default())?;
    exp.add_device("urukul0", DeviceKind::Urukul, 1_000)?;
    exp.add_channel("urukul0", "ch0", 0, ChannelState::default())?;
    exp.add_channel("urukul0", "ch1", 0, ChannelState::default())?;
    exp.add_device("suservo0", DeviceKind::SuServo, 0)?;
    exp.add_channel("suservo0", "ch0", 1_200, ChannelState::default())?;

    let beams = BeamController::new(vec![
        BeamSpec {
            name: "mot".to_string(),
            aom: ChannelRef::new("urukul0", "ch0"),
            shutter: Some(ChannelRef::new("ttl0", "ttl4")),
            defaults: BeamDefaults::default(),
        },
        BeamSpec {
            name: "imaging".to_string(),
            aom: ChannelRef::new("urukul0", "ch1"),
            shutter: Some(ChannelRef::new("ttl0", "ttl5")),
            defaults: BeamDefaults::default(),
        },
    ])?;
    let servos = SuServoController::new(vec![SuServoSpec {
        name: "odt".to_string(),
        channel: ChannelRef::new("suservo0", "ch0"),
        default_setpoint: 1.0,
        default_enabled: true,
        hold_amplitude: 0.1,
    }])?;

    let mut timer = TickTimer::new();
    exp.at_mu(exp.timebase().seconds_to_mu(10e-3));
    beams.set_to_defaults(&mut exp)?;
    servos.set_defaults(&mut exp)?;
    exp.delay(1e-3);
    beams.turn_on(&mut exp, &["mot", "imaging"])?;
    exp.delay(50e-3);
    beams.turn_off(&mut exp, &["mot", "imaging"])?;

    let setpoints = btreemap! {"odt" => 2.5};
    let setpoints: Vec<(&str, f64)> = setpoints.into_iter().collect();
    exp.delay(10e-3);
    servos.set_setpoints(&mut exp, &setpoints)?;
    timer.tick_log("scheduled");

    let seq = exp.compile(None)?;
    timer.tick_log("compiled");
    Ok(seq)
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match build() {
        Ok(seq) => {
            for event in &seq.events {
                println!("{event}");
            }
            println!("{:?}", seq.lane_report);
        }
        Err(e) => {
            tracing::error!(error = %e, "scheduling failed");
            std::process::exit(1);
        }
    }
}
