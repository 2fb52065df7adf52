use fusion_sd::logging;
use fusion_sd::runtime::SdRuntime;
use fusion_sd::runtime::config::ServerSdConfig;
use fusion_sd::sd::testing::{ConfigBuilder, NullSink, RecordingConnections, deterministic_server};
use fusion_sd::sd::{RoutingTable, ServerPhase, SinkRef};
use std::sync::Arc;
use std::time::Duration;

const SERVICE: u16 = 0x1234;

fn runtime(sd_port: u16) -> SdRuntime {
    let mut config = ConfigBuilder::new("127.0.0.1".parse().unwrap())
        .service(SERVICE, &[(1, &[0x8001])])
        .provide(
            SERVICE,
            1,
            30501,
            ServerSdConfig { initial_delay_min_ms: 20, initial_delay_max_ms: 20, ..deterministic_server() },
        )
        .build();
    config.network_endpoints[0].sd_port = sd_port;
    SdRuntime::new(config, Box::new(RecordingConnections::new()), Box::new(RoutingTable::new())).unwrap()
}

#[tokio::test]
async fn test_offer_made_while_running_reaches_main() {
    logging::init_for_tests();
    let rt = runtime(30990);
    rt.start();

    let app = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let sink: SinkRef = Arc::new(NullSink);
        rt.with_sd(|sd| sd.offer_service(SERVICE, 1, sink)).unwrap();
        assert_eq!(rt.with_sd(|sd| sd.server_phases(SERVICE, 1)), vec![ServerPhase::InitialWait]);

        // initial wait 20 ms, repetitions at +50 and +150 ms
        tokio::time::sleep(Duration::from_millis(500)).await;
        let phases = rt.with_sd(|sd| sd.server_phases(SERVICE, 1));
        rt.stop();
        phases
    };
    let (run, phases) = tokio::join!(rt.run(), app);

    run.unwrap();
    assert_eq!(phases, vec![ServerPhase::Main]);
    assert!(!rt.is_running());
}

#[test]
fn test_polling_mode_fires_due_timers() {
    logging::init_for_tests();
    let rt = runtime(30991);
    rt.start();
    let sink: SinkRef = Arc::new(NullSink);
    rt.with_sd(|sd| sd.offer_service(SERVICE, 1, sink)).unwrap();

    std::thread::sleep(Duration::from_millis(30));
    rt.process_next_packet();
    assert_eq!(rt.with_sd(|sd| sd.server_phases(SERVICE, 1)), vec![ServerPhase::Repetition]);
    rt.stop();
}
