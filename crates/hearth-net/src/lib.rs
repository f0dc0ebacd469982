#![doc = r#"
# hearth-net

## 设计动机（Why）
- **定位**：该 crate 是 Hearth 的网络端点核心——TCP 牧马层负责监听套接字与
  连接生命周期治理，协议牧马层驱动 HTTP/1、HTTP/2 与 HTTPS 的帧级状态机，
  虚拟主机层按 SNI 选取证书，限流层提供连接准入与出站字节整形。
- **架构角色**：向下依赖 `hearth-core` 的组件协议、Threadlet 与令牌桶；向上
  被 `hearth-hosting` 的端点组件装配与驱动。
- **设计理念**：协议层只面对“已准入、已包装、已登记”的连接；每条连接的
  准入、计量、空闲超时与收尾日志都收敛在 TCP 牧马层，一处治理、处处一致。

## 核心契约（What）
- **套接字所有权**：连接在开放集合中即归牧马层所有；交付协议层后由其驱动
  读写，收尾权始终在牧马层的宽限阶梯手中；
- **HTTP 语义**：字节级帧化委托 hyper；请求体上限、目标分类、单值头规整、
  404/500 翻译与访问日志投递是本层强加的语义约束；
- **SNI 契约**：解析回调绝不恐慌，证书构建失败折叠为“无证书”并记录日志。

## 实现策略（How）
- **执行框架**：Tokio + `tokio::select!`（关键路径 `biased`）；接受循环与
  消费循环都是可协作停止的 Threadlet；
- **TLS**：rustls + tokio-rustls，按绑定惰性构建 `CertifiedKey` 并缓存；
- **整形**：令牌桶以“先取额度、后写套接字”的顺序作用于写路径，短写额度
  保留为信用。

## 风险与考量（Trade-offs）
- **线性主机查找**：绑定数量按虚拟主机计，线性扫描优于维护前缀树的复杂度；
- **硬销毁语义**：丢弃连接 Future 即确定性关闭套接字，“销毁失败再等待”
  的兜底阶梯在这里不再需要。
"#]

pub mod access;
pub mod error;
pub mod hosts;
pub mod http;
pub mod rate;
pub mod tcp;

pub use access::{AccessEvent, AccessLogSink, CloseReason, RequestSummary};
pub use error::NetError;
pub use hosts::{HostBinding, HostRegistry, HostnamePattern};
pub use rate::{BoxedIo, ConnectionRateLimiter, DataRateLimiter, ShapedWriter};
pub use self::http::{
    IncomingRequest, OutgoingResponse, Protocol, ProtocolWrangler, ProtocolWranglerConfig,
    RequestHandler, RequestTarget, ResponseBody, empty_body, full_body, text_response,
};
pub use tcp::{Connection, ConnectionHandler, TcpWrangler, TcpWranglerConfig, WranglerTimeouts};
