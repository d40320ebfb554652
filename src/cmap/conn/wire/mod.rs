mod header;
mod message;
mod util;

pub(crate) use self::{
    header::{Header, OpCode},
    message::{write_op_query_to, DocumentSequence, Message, MessageFlags},
    util::next_request_id,
};
