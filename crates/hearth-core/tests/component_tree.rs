//! 组件树集成测试：跨管理器的生命周期推进、重启回环与停机条件。

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use hearth_core::component::{
    Component, ComponentCell, ComponentManager, ComponentName, ComponentState, InterfaceId,
};
use hearth_core::error::BoxError;
use hearth_core::lifecycle;

trait Probe: Send + Sync {}

fn probe_interface() -> InterfaceId {
    InterfaceId::of::<dyn Probe>("Probe")
}

/// 记录生命周期事件的叶子组件。
struct Leaf {
    cell: ComponentCell,
    name: ComponentName,
    journal: Arc<Mutex<Vec<String>>>,
}

impl Leaf {
    fn new(name: &str, journal: Arc<Mutex<Vec<String>>>) -> Arc<dyn Component> {
        Arc::new(Self {
            cell: ComponentCell::new(),
            name: ComponentName::parse(name).unwrap(),
            journal,
        }) as Arc<dyn Component>
    }
}

#[async_trait]
impl Component for Leaf {
    fn cell(&self) -> &ComponentCell {
        &self.cell
    }

    fn class_name(&self) -> &'static str {
        "leaf"
    }

    fn configured_name(&self) -> Option<ComponentName> {
        Some(self.name.clone())
    }

    fn interfaces(&self) -> Vec<InterfaceId> {
        vec![probe_interface()]
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    async fn impl_start(self: Arc<Self>) -> Result<(), BoxError> {
        self.journal.lock().push(format!("start:{}", self.name));
        Ok(())
    }

    async fn impl_stop(self: Arc<Self>, will_reload: bool) -> Result<(), BoxError> {
        self.journal
            .lock()
            .push(format!("stop:{}:{}", self.name, will_reload));
        Ok(())
    }
}

/// 管理器级联：init 级联萌芽子组件，start 按挂载顺序推进，停机落回 stopped。
#[tokio::test]
async fn manager_hierarchy_lifecycle_round_trip() {
    let journal = Arc::new(Mutex::new(Vec::new()));
    let manager = ComponentManager::new(
        "probe-manager",
        ComponentName::parse("probes").ok(),
        Some(probe_interface()),
    );

    manager
        .add_all(vec![
            Leaf::new("first", Arc::clone(&journal)),
            Leaf::new("second", Arc::clone(&journal)),
        ])
        .await
        .expect("children accepted");

    let manager_dyn: Arc<dyn Component> = Arc::clone(&manager) as Arc<dyn Component>;
    lifecycle::init_root(&manager_dyn).await.expect("init");
    lifecycle::start(&manager_dyn).await.expect("start");

    // 启动按挂载顺序逐个推进。
    assert_eq!(
        *journal.lock(),
        vec!["start:first".to_string(), "start:second".to_string()],
    );
    for child in manager.children() {
        assert_eq!(child.cell().state(), ComponentState::Running);
    }

    // 重载式停机：will_reload 透传到叶子。
    lifecycle::stop(&manager_dyn, true).await.expect("stop");
    {
        let entries = journal.lock();
        assert!(entries.contains(&"stop:first:true".to_string()));
        assert!(entries.contains(&"stop:second:true".to_string()));
    }

    // 重启回环：同一棵树可再次启动。
    lifecycle::start(&manager_dyn).await.expect("restart");
    for child in manager.children() {
        assert_eq!(child.cell().state(), ComponentState::Running);
    }
    lifecycle::stop(&manager_dyn, false).await.expect("final stop");
}

/// when_stopped 的等待者在整树停机完成后全部释放。
#[tokio::test]
async fn when_stopped_releases_all_waiters() {
    let journal = Arc::new(Mutex::new(Vec::new()));
    let manager = ComponentManager::new("probe-manager", None, None);
    manager
        .add_all(vec![Leaf::new("only", Arc::clone(&journal))])
        .await
        .expect("child accepted");

    let manager_dyn: Arc<dyn Component> = Arc::clone(&manager) as Arc<dyn Component>;
    lifecycle::init_root(&manager_dyn).await.expect("init");
    lifecycle::start(&manager_dyn).await.expect("start");

    let mut waiters = Vec::new();
    for _ in 0..3 {
        waiters.push(tokio::spawn({
            let manager_dyn = Arc::clone(&manager_dyn);
            async move { lifecycle::when_stopped(&manager_dyn).await }
        }));
    }
    tokio::task::yield_now().await;

    lifecycle::stop(&manager_dyn, false).await.expect("stop");
    for waiter in waiters {
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("waiter must resolve")
            .expect("join");
    }
    assert!(journal.lock().contains(&"stop:only:false".to_string()));
}
