use std::sync::Arc;

use spm::{notify, BridgeOptions, Frame, HookPoint, Rule, RuleDb, RuleInner, RuleOutput, Service};
use tokio_stream::StreamExt;

#[tokio::main]
async fn main() {
    let _ = tracing_subscriber::fmt::try_init();

    let db = Arc::new(RuleDb::new());
    let service = Service::new(Arc::clone(&db), BridgeOptions::default());
    service.enable();

    // Forward rule changes to an async consumer
    let (observer, mut events) = notify::channel(16);
    db.register(observer).unwrap();

    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            println!("Rule {} {:?} (flags {:?})", event.rule.id, event.kind, event.flags);
        }
    });

    // Web traffic keeps its own priority, everything else follows DSCP
    db.apply_update(&Rule::add(1, 10, RuleInner::new(RuleOutput::UserPriority).dst_port(80)))
        .unwrap();
    db.apply_update(&Rule::add(2, 5, RuleInner::new(RuleOutput::Dscp).always())).unwrap();

    // An IPv4/TCP frame to port 443 with DSCP AF41 (dsfield 0x88)
    let mut data = vec![0x02, 0, 0, 0, 0, 0x02, 0x02, 0, 0, 0, 0, 0x01, 0x08, 0x00];
    data.extend_from_slice(&[0x45, 0x88, 0, 40, 0, 0, 0, 0, 64, 6, 0, 0]);
    data.extend_from_slice(&[192, 168, 1, 10, 10, 0, 0, 1]);
    data.extend_from_slice(&[0xC3, 0x50, 0x01, 0xBB]);
    data.resize(data.len() + 16, 0);

    let mut frame = Frame::new(&data, 3);
    let verdict = service.process(HookPoint::PreRouting, &mut frame);
    println!("Verdict: {:?}, priority: {}", verdict, frame.priority);

    println!("{}", service.dump());

    db.unregister();
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
}
