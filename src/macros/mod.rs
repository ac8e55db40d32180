mod reply_error;
