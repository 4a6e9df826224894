pub mod billing;
pub mod device;
pub mod firmware;
pub mod liveness;
pub mod reading;
pub mod reset;

pub use billing::{split_bill, BillSetting, BillSplit, BillingPeriod, ChannelEnergy, ChannelShare};
pub use device::{Channel, Device, NewDevice, RegistrationError, Unassignment};
pub use firmware::{FirmwareObject, OtaStage, OtaStatusUpdate};
pub use liveness::{OnlineSnapshot, DEFAULT_STALENESS_THRESHOLD};
pub use reading::{ChannelKey, Reading, Sample};
pub use reset::{quorum_reached, Profile, ResetSession, ResetVote, SessionStatus, VoteInsert, DEFAULT_SESSION_TTL};
