use std::sync::atomic::AtomicBool;
use std::time;

use validator_server::mock::{self, Call, MockDevice};
use validator_server::protocol::jcm::status;
use validator_server::{
    DeviceConfiguration, Error, InitializationSequencer, NoteReporting, Operation, Protocol,
    Result, RetryPolicy, SequencerState, TransportError, ValidatorState,
};

mod common;

fn policy(attempts: u32) -> RetryPolicy {
    RetryPolicy::new(attempts, time::Duration::ZERO)
}

fn set_calls(calls: &[Call]) -> Vec<(Operation, Vec<u8>)> {
    calls
        .iter()
        .filter_map(|call| match call {
            Call::Set(op, input) => Some((*op, input.clone())),
            _ => None,
        })
        .collect()
}

#[test]
fn test_jcm_sequence() -> Result<()> {
    let _lock = common::init()?;

    let mut device = MockDevice::new()
        .then_repeat(mock::jcm_status(status::INITIALIZING), 5)
        .then_frame(mock::jcm_status(status::ENABLE));
    let calls = device.calls();

    let dialect = Protocol::Jcm.dialect();
    let mut sequencer =
        InitializationSequencer::new(dialect.as_ref(), DeviceConfiguration::default(), policy(30));

    assert_eq!(sequencer.state(), SequencerState::Reset);

    let ready = sequencer.run(&mut device, None)?;

    assert_eq!(sequencer.state(), SequencerState::Ready);
    assert_eq!(ready.wait_retries, 5);
    assert_eq!(ready.device_state, ValidatorState::Enable);
    assert_eq!(calls.count(Operation::GetStatus), 6);

    let expected: Vec<(Operation, Vec<u8>)> = vec![
        (Operation::SetEnable, vec![0x00, 0x00]),
        (Operation::SetSecurity, vec![0x00, 0x00]),
        (Operation::SetOptionalFunction, vec![0x03, 0x00]),
        (Operation::SetInhibit, vec![0x00]),
        (Operation::SetBarcodeDecoding, vec![0x01, 0x12]),
        (Operation::SetBarcodeInhibit, vec![0xfc]),
    ];

    assert_eq!(
        ready.applied,
        expected.iter().map(|(op, _)| *op).collect::<Vec<_>>()
    );
    assert_eq!(set_calls(&calls.snapshot()), expected);

    // reset goes out before anything else
    assert_eq!(calls.operations().first(), Some(&Operation::Reset));

    Ok(())
}

#[test]
fn test_mei_sequence() -> Result<()> {
    let _lock = common::init()?;

    let mut device = MockDevice::new().then_frame(mock::mei_idle());
    let calls = device.calls();

    let dialect = Protocol::Mei.dialect();
    let ready = InitializationSequencer::new(
        dialect.as_ref(),
        DeviceConfiguration::default(),
        policy(30),
    )
    .run(&mut device, None)?;

    assert_eq!(ready.wait_retries, 0);
    assert_eq!(
        ready.applied,
        vec![
            Operation::SetDenomination,
            Operation::SetInterruptMode,
            Operation::SetSecurity,
            Operation::SetOrientation,
            Operation::SetEscrowMode,
            Operation::SetPushMode,
            Operation::SetBarcodeDecoding,
            Operation::SetPowerup,
            Operation::SetExtendedNoteReporting,
            Operation::SetExtendedInhibits,
            Operation::SetExtendedCouponReporting,
        ]
    );
    assert_eq!(calls.count(Operation::SetEnable), 0);
    assert_eq!(calls.count(Operation::SetInhibit), 0);

    Ok(())
}

#[test]
fn test_mei_plain_reporting_skips_extended_inhibits() -> Result<()> {
    let _lock = common::init()?;

    let mut device = MockDevice::new().then_frame(mock::mei_idle());
    let calls = device.calls();

    let configuration = DeviceConfiguration {
        note_reporting: NoteReporting::Plain,
        ..Default::default()
    };

    let dialect = Protocol::Mei.dialect();
    let ready = InitializationSequencer::new(dialect.as_ref(), configuration, policy(30))
        .run(&mut device, None)?;

    assert!(!ready.applied.contains(&Operation::SetExtendedInhibits));
    assert_eq!(calls.count(Operation::SetExtendedInhibits), 0);
    assert_eq!(
        set_calls(&calls.snapshot())
            .into_iter()
            .find(|(op, _)| *op == Operation::SetExtendedNoteReporting),
        Some((Operation::SetExtendedNoteReporting, vec![0x00]))
    );

    Ok(())
}

#[test]
fn test_configuration_failure_stops_sequence() -> Result<()> {
    let _lock = common::init()?;

    for protocol in [Protocol::Jcm, Protocol::Mei] {
        let idle = match protocol {
            Protocol::Jcm => mock::jcm_status(status::ENABLE),
            Protocol::Mei => mock::mei_idle(),
        };

        let mut device = MockDevice::new()
            .then_frame(idle)
            .fail_on(Operation::SetSecurity, TransportError::Nak(0x4b));
        let calls = device.calls();

        let dialect = protocol.dialect();
        let mut sequencer = InitializationSequencer::new(
            dialect.as_ref(),
            DeviceConfiguration::default(),
            policy(30),
        );

        assert_eq!(
            sequencer.run(&mut device, None),
            Err(Error::Configuration {
                step: "SetSecurity",
                source: TransportError::Nak(0x4b),
            }),
            "{protocol}"
        );
        assert_eq!(sequencer.state(), SequencerState::Failed);

        // nothing after the failed step is written
        let ops = calls.operations();
        assert_eq!(ops.last(), Some(&Operation::SetSecurity), "{protocol}");
        assert_eq!(calls.count(Operation::SetBarcodeDecoding), 0, "{protocol}");
    }

    Ok(())
}

#[test]
fn test_reset_failure() -> Result<()> {
    let _lock = common::init()?;

    let mut device = MockDevice::with_frames([mock::jcm_status(status::ENABLE)])
        .fail_on(Operation::Reset, TransportError::Timeout);
    let calls = device.calls();

    let dialect = Protocol::Jcm.dialect();
    let mut sequencer =
        InitializationSequencer::new(dialect.as_ref(), DeviceConfiguration::default(), policy(30));

    assert_eq!(
        sequencer.run(&mut device, None),
        Err(Error::Configuration {
            step: "Reset",
            source: TransportError::Timeout,
        })
    );
    assert_eq!(sequencer.state(), SequencerState::Failed);
    assert_eq!(calls.count(Operation::GetStatus), 0);

    Ok(())
}

#[test]
fn test_init_timeout() -> Result<()> {
    let _lock = common::init()?;

    let mut device = MockDevice::with_frames([mock::jcm_status(status::INITIALIZING)]);
    let calls = device.calls();

    let dialect = Protocol::Jcm.dialect();
    let mut sequencer =
        InitializationSequencer::new(dialect.as_ref(), DeviceConfiguration::default(), policy(4));

    assert_eq!(
        sequencer.run(&mut device, None),
        Err(Error::InitTimeout { attempts: 4 })
    );
    assert_eq!(sequencer.state(), SequencerState::Failed);
    assert_eq!(calls.count(Operation::GetStatus), 4);
    assert_eq!(calls.count(Operation::SetEnable), 0);

    Ok(())
}

#[test]
fn test_read_errors_count_as_retries() -> Result<()> {
    let _lock = common::init()?;

    let mut device = MockDevice::new()
        .then_error(TransportError::Timeout)
        .then_frame(mock::jcm_status(status::INITIALIZING))
        .then_error(TransportError::Io("framing error".into()))
        .then_frame(mock::jcm_status(status::DISABLED));

    let dialect = Protocol::Jcm.dialect();
    let ready = InitializationSequencer::new(
        dialect.as_ref(),
        DeviceConfiguration::default(),
        policy(30),
    )
    .run(&mut device, None)?;

    assert_eq!(ready.wait_retries, 3);
    assert_eq!(ready.device_state, ValidatorState::Disabled);

    Ok(())
}

#[test]
fn test_short_status_retries() -> Result<()> {
    let _lock = common::init()?;

    // Protocol M needs at least five status bytes
    let mut device = MockDevice::new()
        .then_frame(vec![0x20, 0x01])
        .then_frame(mock::mei_idle());

    let dialect = Protocol::Mei.dialect();
    let ready = InitializationSequencer::new(
        dialect.as_ref(),
        DeviceConfiguration::default(),
        policy(30),
    )
    .run(&mut device, None)?;

    assert_eq!(ready.wait_retries, 1);

    Ok(())
}

#[test]
fn test_cancelled_wait() -> Result<()> {
    let _lock = common::init()?;

    let mut device = MockDevice::with_frames([mock::jcm_status(status::INITIALIZING)]);
    let cancel = AtomicBool::new(true);

    let dialect = Protocol::Jcm.dialect();
    let mut sequencer = InitializationSequencer::new(
        dialect.as_ref(),
        DeviceConfiguration::default(),
        RetryPolicy::new(30, time::Duration::from_millis(common::TEST_POLL_MS)),
    );

    assert!(matches!(
        sequencer.run(&mut device, Some(&cancel)),
        Err(Error::Cancelled(_))
    ));
    assert_eq!(sequencer.state(), SequencerState::Failed);

    Ok(())
}
